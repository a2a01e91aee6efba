//! Per-peer session state.

use std::time::{Duration, Instant};

use murmur_core::PeerId;
use murmur_crypto::{EphemeralKeyPair, SessionCipher};
use murmur_identity::{IdentityFingerprint, PublicIdentityBundle};
use serde::{Deserialize, Serialize};

use crate::handshake::HandshakeOffer;

/// Externally visible session state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateKind {
    /// Never handshaken, or the last handshake failed
    NoSession,
    /// Our offer is out, waiting for the peer's
    HandshakeInProgress,
    /// A current generation is usable
    Established,
    /// A current generation is usable and a rotation is in flight
    Rotating,
    /// Session material dropped; a new handshake may start
    Revoked,
}

/// Public description of the current session with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub peer_id: PeerId,
    pub generation: u32,
    /// Log-safe key identifier, equal on both ends
    pub key_id: String,
    pub local_fingerprint: IdentityFingerprint,
    pub remote_fingerprint: IdentityFingerprint,
    /// Superseded generation still inside its grace window
    pub previous_generation: Option<u32>,
}

/// Per-peer traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub messages_sealed: u64,
    pub messages_opened: u64,
    pub decrypt_failures: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
}

/// Our half of an in-flight handshake.
pub(crate) struct PendingHandshake {
    pub ephemeral: EphemeralKeyPair,
    pub local_offer: HandshakeOffer,
    pub remote_bundle: PublicIdentityBundle,
    pub started_at: Instant,
    pub epoch: u64,
}

impl PendingHandshake {
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= timeout
    }
}

/// One keyed generation.
pub(crate) struct Generation {
    pub cipher: SessionCipher,
    pub key_id: String,
    pub local_fingerprint: IdentityFingerprint,
    pub remote_bundle: PublicIdentityBundle,
    /// Identity epoch the key was derived under
    pub epoch: u64,
}

impl Generation {
    pub fn number(&self) -> u32 {
        self.cipher.generation()
    }
}

/// A superseded generation kept for in-flight decrypts.
pub(crate) struct RetiredGeneration {
    pub generation: Generation,
    pub retired_at: Instant,
}

/// Everything the establisher knows about one peer. Guarded by the peer's
/// own mutex.
#[derive(Default)]
pub(crate) struct PeerSlot {
    pub current: Option<Generation>,
    pub previous: Option<RetiredGeneration>,
    pub pending: Option<PendingHandshake>,
    pub revoked: bool,
    /// Highest generation ever keyed for this peer; survives revocation
    pub last_generation: u32,
    pub stats: SessionStats,
}

impl PeerSlot {
    /// Drop material that is no longer usable at `now` under `epoch`.
    ///
    /// Returns `true` when a session was lost to an identity wipe.
    pub fn expire(&mut self, now: Instant, epoch: u64, grace: Duration) -> bool {
        let retired_expired = self
            .previous
            .as_ref()
            .is_some_and(|retired| {
                retired.generation.epoch != epoch
                    || now.saturating_duration_since(retired.retired_at) >= grace
            });
        if retired_expired {
            self.previous = None;
        }

        if self.pending.as_ref().is_some_and(|p| p.epoch != epoch) {
            self.pending = None;
        }

        if self.current.as_ref().is_some_and(|g| g.epoch != epoch) {
            self.clear();
            self.revoked = true;
            return true;
        }

        false
    }

    /// Drop all session material. Counters and the generation floor remain.
    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
        self.pending = None;
    }

    pub fn state(&self, now: Instant, timeout: Duration) -> SessionStateKind {
        let handshaking = self
            .pending
            .as_ref()
            .is_some_and(|pending| !pending.timed_out(now, timeout));

        match (&self.current, handshaking) {
            (Some(_), true) => SessionStateKind::Rotating,
            (Some(_), false) => SessionStateKind::Established,
            (None, true) => SessionStateKind::HandshakeInProgress,
            (None, false) if self.revoked => SessionStateKind::Revoked,
            (None, false) => SessionStateKind::NoSession,
        }
    }

    pub fn info(&self, peer_id: &PeerId) -> Option<SessionInfo> {
        self.current.as_ref().map(|current| SessionInfo {
            peer_id: peer_id.clone(),
            generation: current.number(),
            key_id: current.key_id.clone(),
            local_fingerprint: current.local_fingerprint,
            remote_fingerprint: current.remote_bundle.fingerprint(),
            previous_generation: self
                .previous
                .as_ref()
                .map(|retired| retired.generation.number()),
        })
    }
}
