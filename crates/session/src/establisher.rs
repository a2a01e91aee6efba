//! Session Establisher: per-peer handshake state machine and session cipher
//! ownership.
//!
//! # Synchronization
//!
//! The peer map is behind an `RwLock` that is held only long enough to look
//! up or insert a peer's slot. Each slot has its own mutex, held for the
//! whole of one handshake step, encrypt or decrypt. Operations on different
//! peers therefore run in parallel while operations on one peer serialize,
//! which is what makes "one handshake in flight per peer" enforceable.
//!
//! # Identity binding
//!
//! Every generation records the identity epoch it was derived under. Once
//! the key store is wiped, all older generations are refused on next
//! access, even if the wipe bypassed [`SessionEstablisher::wipe_all`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use murmur_core::{Clock, PeerId, SessionConfig, SystemClock};
use murmur_crypto::{frame_generation, EphemeralKeyPair, SessionCipher};
use murmur_identity::{IdentityKeyStore, PublicIdentityBundle};
use murmur_mesh::PresenceEvent;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{SessionError, SessionResult};
use crate::events::{RevocationReason, SessionEvent};
use crate::handshake::{self, HandshakeOffer};
use crate::state::{
    Generation, PeerSlot, PendingHandshake, RetiredGeneration, SessionInfo, SessionStateKind,
    SessionStats,
};

type Slot = Arc<Mutex<PeerSlot>>;

/// Establishes, rotates and revokes per-peer sessions.
pub struct SessionEstablisher {
    identity: Arc<IdentityKeyStore>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    peers: RwLock<HashMap<PeerId, Slot>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionEstablisher {
    pub fn new(identity: Arc<IdentityKeyStore>, config: SessionConfig) -> Self {
        Self::with_clock(identity, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        identity: Arc<IdentityKeyStore>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            identity,
            config,
            clock,
            peers: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn identity(&self) -> &Arc<IdentityKeyStore> {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a handshake with `peer_id`, whose identity bundle is
    /// `remote_bundle`. The returned offer must be delivered to the peer.
    ///
    /// If a session already exists it stays in use until the handshake
    /// completes (the peer is then `Rotating`).
    pub fn begin_handshake(
        &self,
        peer_id: &PeerId,
        remote_bundle: &[u8],
    ) -> SessionResult<HandshakeOffer> {
        let remote_bundle = PublicIdentityBundle::from_bytes(remote_bundle)
            .map_err(|e| SessionError::MalformedBundle(e.to_string()))?;

        let slot = self.slot(peer_id);
        let mut slot = lock_slot(&slot);
        let now = self.clock.now();
        self.refresh(peer_id, &mut slot, now);

        self.start(peer_id, &mut slot, remote_bundle, now)
    }

    /// Start a rotation of an established session.
    pub fn rotate(&self, peer_id: &PeerId) -> SessionResult<HandshakeOffer> {
        let slot = self
            .existing_slot(peer_id)
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;
        let mut slot = lock_slot(&slot);
        let now = self.clock.now();
        self.refresh(peer_id, &mut slot, now);

        let remote_bundle = slot
            .current
            .as_ref()
            .map(|current| current.remote_bundle.clone())
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;

        self.start(peer_id, &mut slot, remote_bundle, now)
    }

    fn start(
        &self,
        peer_id: &PeerId,
        slot: &mut PeerSlot,
        remote_bundle: PublicIdentityBundle,
        now: Instant,
    ) -> SessionResult<HandshakeOffer> {
        if let Some(pending) = &slot.pending {
            if !pending.timed_out(now, self.config.handshake_timeout()) {
                return Err(SessionError::HandshakeInProgress(peer_id.to_string()));
            }
            tracing::debug!(peer_id = %peer_id, "replacing timed-out handshake");
        }

        let generation = slot
            .last_generation
            .checked_add(1)
            .ok_or_else(|| SessionError::GenerationExhausted(peer_id.to_string()))?;

        let epoch = self.identity.epoch();
        let ephemeral = EphemeralKeyPair::generate();
        let recipient = remote_bundle.fingerprint();
        let offer = self.identity.with_keys(|keys| {
            HandshakeOffer::sign(
                keys,
                &ephemeral.public,
                murmur_crypto::random_bytes(),
                generation,
                &recipient,
            )
        })?;

        tracing::debug!(
            peer_id = %peer_id,
            remote = %recipient.short(),
            generation,
            rotating = slot.current.is_some(),
            "handshake offer created"
        );

        slot.revoked = false;
        slot.pending = Some(PendingHandshake {
            ephemeral,
            local_offer: offer.clone(),
            remote_bundle,
            started_at: now,
            epoch,
        });

        Ok(offer)
    }

    /// Finish the in-flight handshake with the peer's offer.
    ///
    /// On failure the in-flight handshake is discarded; an existing session
    /// (rotation case) is kept.
    pub fn complete_handshake(
        &self,
        peer_id: &PeerId,
        remote_offer: &HandshakeOffer,
    ) -> SessionResult<SessionInfo> {
        let slot = self
            .existing_slot(peer_id)
            .ok_or_else(|| SessionError::NoHandshake(peer_id.to_string()))?;
        let mut slot = lock_slot(&slot);
        let now = self.clock.now();
        self.refresh(peer_id, &mut slot, now);

        let pending = slot
            .pending
            .take()
            .ok_or_else(|| SessionError::NoHandshake(peer_id.to_string()))?;

        match self.finish(peer_id, &mut slot, pending, remote_offer, now) {
            Ok(info) => Ok(info),
            Err(e) => {
                slot.stats.handshakes_failed += 1;
                tracing::warn!(peer_id = %peer_id, error = %e, "handshake failed");
                self.emit(SessionEvent::HandshakeFailed {
                    peer_id: peer_id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn finish(
        &self,
        peer_id: &PeerId,
        slot: &mut PeerSlot,
        pending: PendingHandshake,
        remote_offer: &HandshakeOffer,
        now: Instant,
    ) -> SessionResult<SessionInfo> {
        if pending.timed_out(now, self.config.handshake_timeout()) {
            return Err(SessionError::HandshakeTimedOut(peer_id.to_string()));
        }

        if remote_offer.bundle != pending.remote_bundle {
            return Err(SessionError::AuthenticationFailed(
                "offer identity differs from the bundle the handshake began with".to_string(),
            ));
        }

        let local_fingerprint = pending.local_offer.bundle.fingerprint();
        remote_offer.verify(&local_fingerprint)?;

        let key = self.identity.with_keys(|keys| {
            if keys.bundle() != &pending.local_offer.bundle {
                return Err(SessionError::AuthenticationFailed(
                    "local identity changed during handshake".to_string(),
                ));
            }
            handshake::agree(keys, &pending.ephemeral, &pending.local_offer, remote_offer)
        })??;

        let generation = pending.local_offer.generation.max(remote_offer.generation);
        let key_id = key.key_id();
        let cipher = SessionCipher::new(&key, generation, now).with_limits(
            self.config.max_messages_per_generation,
            self.config.max_generation_age(),
        );

        let fresh = Generation {
            cipher,
            key_id: key_id.clone(),
            local_fingerprint,
            remote_bundle: pending.remote_bundle,
            epoch: pending.epoch,
        };

        let previous = slot.current.replace(fresh);
        slot.previous = previous.map(|generation| RetiredGeneration {
            generation,
            retired_at: now,
        });
        slot.last_generation = generation;
        slot.revoked = false;
        slot.stats.handshakes_completed += 1;

        let event = match &slot.previous {
            Some(retired) => SessionEvent::Rotated {
                peer_id: peer_id.clone(),
                previous: retired.generation.number(),
                generation,
                key_id: key_id.clone(),
            },
            None => SessionEvent::Established {
                peer_id: peer_id.clone(),
                generation,
                key_id: key_id.clone(),
            },
        };
        tracing::info!(peer_id = %peer_id, generation, key_id = %key_id, "session established");
        self.emit(event);

        slot.info(peer_id)
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))
    }

    /// Seal `plaintext` under the peer's current generation.
    pub fn encrypt(&self, peer_id: &PeerId, plaintext: &[u8]) -> SessionResult<Vec<u8>> {
        let slot = self
            .existing_slot(peer_id)
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;
        let mut slot = lock_slot(&slot);
        self.refresh(peer_id, &mut slot, self.clock.now());

        let current = slot
            .current
            .as_mut()
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;
        let frame = current.cipher.seal(plaintext)?;
        slot.stats.messages_sealed += 1;
        Ok(frame)
    }

    /// Open a frame from the peer under the generation its header names.
    ///
    /// Failures are final; the frame should be dropped.
    pub fn decrypt(&self, peer_id: &PeerId, frame: &[u8]) -> SessionResult<Vec<u8>> {
        let slot = self
            .existing_slot(peer_id)
            .ok_or_else(|| SessionError::NoSession(peer_id.to_string()))?;
        let mut slot = lock_slot(&slot);
        self.refresh(peer_id, &mut slot, self.clock.now());

        if slot.current.is_none() && slot.previous.is_none() {
            return Err(SessionError::NoSession(peer_id.to_string()));
        }

        match open(&mut slot, frame) {
            Ok(plaintext) => {
                slot.stats.messages_opened += 1;
                Ok(plaintext)
            }
            Err(e) => {
                slot.stats.decrypt_failures += 1;
                tracing::debug!(peer_id = %peer_id, len = frame.len(), "dropping undecryptable frame");
                Err(e)
            }
        }
    }

    /// Drop all session material for the peer.
    pub fn revoke(&self, peer_id: &PeerId) {
        self.revoke_with(peer_id, RevocationReason::Requested);
    }

    fn revoke_with(&self, peer_id: &PeerId, reason: RevocationReason) -> bool {
        let Some(slot) = self.existing_slot(peer_id) else {
            return false;
        };
        self.revoke_slot(peer_id, &slot, reason)
    }

    /// Revoke and drop the peer's slot, counters and generation floor
    /// included. Used when the radio layer has lost the peer for good.
    fn forget(&self, peer_id: &PeerId, reason: RevocationReason) {
        let removed = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id);
        if let Some(slot) = removed {
            self.revoke_slot(peer_id, &slot, reason);
        }
    }

    fn forget_all(&self, reason: RevocationReason) {
        let drained: Vec<(PeerId, Slot)> = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (peer_id, slot) in drained {
            self.revoke_slot(&peer_id, &slot, reason);
        }
    }

    fn revoke_slot(&self, peer_id: &PeerId, slot: &Mutex<PeerSlot>, reason: RevocationReason) -> bool {
        let mut slot = lock_slot(slot);

        let had_material =
            slot.current.is_some() || slot.previous.is_some() || slot.pending.is_some();
        slot.clear();
        slot.revoked = true;

        if had_material {
            tracing::info!(peer_id = %peer_id, ?reason, "session revoked");
            self.emit(SessionEvent::Revoked {
                peer_id: peer_id.clone(),
                reason,
            });
        }
        had_material
    }

    pub fn session_state(&self, peer_id: &PeerId) -> SessionStateKind {
        let Some(slot) = self.existing_slot(peer_id) else {
            return SessionStateKind::NoSession;
        };
        let mut slot = lock_slot(&slot);
        let now = self.clock.now();
        self.refresh(peer_id, &mut slot, now);
        slot.state(now, self.config.handshake_timeout())
    }

    pub fn session_info(&self, peer_id: &PeerId) -> Option<SessionInfo> {
        let slot = self.existing_slot(peer_id)?;
        let mut slot = lock_slot(&slot);
        self.refresh(peer_id, &mut slot, self.clock.now());
        slot.info(peer_id)
    }

    /// Whether the current generation has hit its message or age limit.
    pub fn rotation_required(&self, peer_id: &PeerId) -> bool {
        let Some(slot) = self.existing_slot(peer_id) else {
            return false;
        };
        let mut slot = lock_slot(&slot);
        let now = self.clock.now();
        self.refresh(peer_id, &mut slot, now);
        slot.current
            .as_ref()
            .is_some_and(|current| current.cipher.rotation_required(now))
    }

    pub fn stats(&self, peer_id: &PeerId) -> SessionStats {
        let Some(slot) = self.existing_slot(peer_id) else {
            return SessionStats::default();
        };
        let stats = lock_slot(&slot).stats;
        stats
    }

    /// Peers with a usable current session, sorted.
    pub fn established_peers(&self) -> Vec<PeerId> {
        let now = self.clock.now();
        let mut peers: Vec<PeerId> = self
            .slots()
            .into_iter()
            .filter(|(peer_id, slot)| {
                let mut slot = lock_slot(slot);
                self.refresh(peer_id, &mut slot, now);
                slot.current.is_some()
            })
            .map(|(peer_id, _)| peer_id)
            .collect();
        peers.sort();
        peers
    }

    /// React to a registry notification. Removal (radio disconnect) and
    /// registry reset revoke and forget the peer; staleness does nothing.
    pub fn handle_presence(&self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Removed { peer_id } => {
                self.forget(peer_id, RevocationReason::PeerRemoved);
            }
            PresenceEvent::Cleared => self.forget_all(RevocationReason::PeerRemoved),
            PresenceEvent::Joined { .. }
            | PresenceEvent::NicknameChanged { .. }
            | PresenceEvent::BecameActive { .. }
            | PresenceEvent::BecameInactive { .. } => {}
        }
    }

    /// Feed registry notifications into [`handle_presence`](Self::handle_presence)
    /// from a Tokio task. Must be called within a runtime.
    ///
    /// The task ends when the registry's channel closes or the establisher
    /// is dropped.
    pub fn spawn_presence_listener(
        self: &Arc<Self>,
        mut presence: broadcast::Receiver<PresenceEvent>,
    ) -> JoinHandle<()> {
        let establisher = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match presence.recv().await {
                    Ok(event) => {
                        let Some(establisher) = establisher.upgrade() else {
                            break;
                        };
                        establisher.handle_presence(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "presence listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Emergency wipe: revoke every session, then destroy the identity.
    pub fn wipe_all(&self) -> SessionResult<()> {
        for (peer_id, _) in self.slots() {
            self.revoke_with(&peer_id, RevocationReason::IdentityWiped);
        }
        self.identity.wipe_all()?;
        tracing::warn!("all sessions and identity wiped");
        Ok(())
    }

    fn slot(&self, peer_id: &PeerId) -> Slot {
        if let Some(slot) = self.existing_slot(peer_id) {
            return slot;
        }
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(peer_id.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, peer_id: &PeerId) -> Option<Slot> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .cloned()
    }

    fn slots(&self) -> Vec<(PeerId, Slot)> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(peer_id, slot)| (peer_id.clone(), slot.clone()))
            .collect()
    }

    /// Apply grace expiry and identity-epoch invalidation.
    fn refresh(&self, peer_id: &PeerId, slot: &mut PeerSlot, now: Instant) {
        if slot.expire(now, self.identity.epoch(), self.config.rotation_grace()) {
            tracing::info!(peer_id = %peer_id, "session invalidated by identity wipe");
            self.emit(SessionEvent::Revoked {
                peer_id: peer_id.clone(),
                reason: RevocationReason::IdentityWiped,
            });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for SessionEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEstablisher")
            .field("peers", &self.slots().len())
            .field("identity_epoch", &self.identity.epoch())
            .finish()
    }
}

fn lock_slot(slot: &Mutex<PeerSlot>) -> MutexGuard<'_, PeerSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open(slot: &mut PeerSlot, frame: &[u8]) -> SessionResult<Vec<u8>> {
    let generation = frame_generation(frame).map_err(|_| SessionError::DecryptionFailed)?;

    if let Some(current) = slot
        .current
        .as_mut()
        .filter(|current| current.number() == generation)
    {
        return current
            .cipher
            .open(frame)
            .map_err(|_| SessionError::DecryptionFailed);
    }

    if let Some(retired) = slot
        .previous
        .as_mut()
        .filter(|retired| retired.generation.number() == generation)
    {
        return retired
            .generation
            .cipher
            .open(frame)
            .map_err(|_| SessionError::DecryptionFailed);
    }

    Err(SessionError::DecryptionFailed)
}
