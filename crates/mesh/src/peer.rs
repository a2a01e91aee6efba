//! Peer Registry: liveness and metadata for radio-adjacent peers.
//!
//! The registry is an explicitly constructed service with an init/shutdown
//! lifecycle. Cloning a [`PeerRegistry`] yields another handle to the same
//! state, so the radio layer, the sweeper and the UI can share it.
//!
//! # Liveness
//!
//! `active` is never stored: a peer is active iff its record exists and
//! `now - last_seen_at < stale_after`. Stale records are retained (their
//! nickname stays available for late-arriving messages) until the radio layer
//! removes them, or until the optional retention window expires.
//!
//! # Synchronization
//!
//! One mutex guards the whole table. Every mutation and every snapshot runs
//! inside a single critical section, so a snapshot never observes a
//! partially-updated record. Presence events are sent while the lock is held
//! to keep their order identical to the order of mutations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use murmur_core::{Clock, PeerId, RegistryConfig, SystemClock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{MeshError, MeshResult};
use crate::events::PresenceEvent;
use crate::sweeper;

/// Liveness record for one peer. Owned exclusively by the registry.
#[derive(Debug, Clone)]
struct PeerRecord {
    nickname: Option<String>,
    first_seen_at: Instant,
    last_seen_at: Instant,
    rssi: Option<i32>,
    announced_to: bool,
    /// Last activity state published to subscribers
    reported_active: bool,
}

impl PeerRecord {
    fn new(nickname: Option<String>, now: Instant) -> Self {
        Self {
            nickname,
            first_seen_at: now,
            last_seen_at: now,
            rssi: None,
            announced_to: false,
            reported_active: true,
        }
    }

    /// Refresh liveness; never moves `last_seen_at` backwards.
    fn touch(&mut self, now: Instant) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen_at)
    }
}

/// Signal strength and announcement state noted before the peer's first
/// announcement. Merged into the record when the peer is added.
#[derive(Debug, Clone, Copy)]
struct PendingMeta {
    rssi: Option<i32>,
    announced_to: bool,
    noted_at: Instant,
}

impl PendingMeta {
    fn new(now: Instant) -> Self {
        Self {
            rssi: None,
            announced_to: false,
            noted_at: now,
        }
    }
}

#[derive(Debug, Default)]
struct PeerTable {
    records: HashMap<PeerId, PeerRecord>,
    pending: HashMap<PeerId, PendingMeta>,
}

impl PeerTable {
    fn clear(&mut self) -> usize {
        let cleared = self.records.len();
        self.records.clear();
        self.pending.clear();
        cleared
    }
}

/// Point-in-time copy of a peer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
    pub rssi: Option<i32>,
    pub announced_to: bool,
    pub active: bool,
    /// Time since the peer was last heard from
    pub last_seen_age: Duration,
    /// Time since first contact
    pub known_for: Duration,
}

/// Outcome of one staleness pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers that crossed the staleness threshold during this pass
    pub newly_inactive: Vec<PeerId>,
    /// Peers evicted by the retention policy
    pub evicted: Vec<PeerId>,
    /// Active peers after the pass
    pub active: usize,
    /// Records retained after the pass
    pub retained: usize,
}

pub(crate) struct RegistryInner {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    table: Mutex<PeerTable>,
    events: broadcast::Sender<PresenceEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryInner {
    /// The table guard. A poisoned lock is recovered: every critical section
    /// leaves the table consistent before it can panic.
    fn table(&self) -> MutexGuard<'_, PeerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, record: &PeerRecord, now: Instant) -> bool {
        record.age(now) < self.config.stale_after()
    }

    fn emit(&self, event: PresenceEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub(crate) fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let stale_after = self.config.stale_after();
        let retention = self.config.retention();
        let mut report = SweepReport::default();

        let mut table = self.table();

        // Pre-contact metadata older than the staleness threshold belongs to
        // a peer that never announced itself.
        table
            .pending
            .retain(|_, meta| now.saturating_duration_since(meta.noted_at) < stale_after);

        let peers = &mut table.records;
        for (peer_id, record) in peers.iter_mut() {
            if record.age(now) >= stale_after && record.reported_active {
                record.reported_active = false;
                report.newly_inactive.push(peer_id.clone());
                self.emit(PresenceEvent::BecameInactive {
                    peer_id: peer_id.clone(),
                });
            }
        }

        if let Some(retention) = retention {
            let expired: Vec<PeerId> = peers
                .iter()
                .filter(|(_, record)| record.age(now) >= retention)
                .map(|(peer_id, _)| peer_id.clone())
                .collect();

            for peer_id in expired {
                peers.remove(&peer_id);
                self.emit(PresenceEvent::Removed {
                    peer_id: peer_id.clone(),
                });
                report.evicted.push(peer_id);
            }
        }

        report.retained = peers.len();
        report.active = peers
            .values()
            .filter(|record| self.is_fresh(record, now))
            .count();

        drop(table);

        report.newly_inactive.sort();
        report.evicted.sort();

        if !report.newly_inactive.is_empty() || !report.evicted.is_empty() {
            tracing::debug!(
                newly_inactive = report.newly_inactive.len(),
                evicted = report.evicted.len(),
                active = report.active,
                retained = report.retained,
                "staleness sweep"
            );
        }

        report
    }
}

/// Concurrent registry of mesh peers.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<RegistryInner>,
}

impl PeerRegistry {
    /// Create an empty registry using the system clock.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create an empty registry with an injected clock.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                config,
                clock,
                table: Mutex::new(PeerTable::default()),
                events,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Subscribe to presence notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Insert a new peer or refresh an existing one.
    ///
    /// Returns `true` when the peer is new, its nickname changed, or it was
    /// stale and is now active again. Returns `false` only for a refresh of
    /// an unchanged, already-active record. Liveness is refreshed either way.
    pub fn add_or_update_peer(&self, peer_id: &PeerId, nickname: &str) -> bool {
        let now = self.inner.clock.now();
        let mut table = self.inner.table();

        let Some(record) = table.records.get_mut(peer_id) else {
            let mut record = PeerRecord::new(Some(nickname.to_string()), now);
            if let Some(meta) = table.pending.remove(peer_id) {
                record.rssi = meta.rssi;
                record.announced_to = meta.announced_to;
            }
            table.records.insert(peer_id.clone(), record);
            tracing::debug!(peer_id = %peer_id, nickname, "peer joined");
            self.inner.emit(PresenceEvent::Joined {
                peer_id: peer_id.clone(),
                nickname: nickname.to_string(),
            });
            return true;
        };

        let was_active = self.inner.is_fresh(record, now);
        record.touch(now);
        let mut updated = !was_active;

        if record.nickname.as_deref() != Some(nickname) {
            let previous = record.nickname.replace(nickname.to_string());
            tracing::debug!(peer_id = %peer_id, nickname, "peer nickname changed");
            self.inner.emit(PresenceEvent::NicknameChanged {
                peer_id: peer_id.clone(),
                previous,
                nickname: nickname.to_string(),
            });
            updated = true;
        }

        if !record.reported_active {
            record.reported_active = true;
            self.inner.emit(PresenceEvent::BecameActive {
                peer_id: peer_id.clone(),
            });
        }

        updated
    }

    /// Delete a peer record and any pre-contact metadata. Idempotent.
    pub fn remove_peer(&self, peer_id: &PeerId) {
        let mut table = self.inner.table();
        table.pending.remove(peer_id);
        if table.records.remove(peer_id).is_some() {
            tracing::debug!(peer_id = %peer_id, "peer removed");
            self.inner.emit(PresenceEvent::Removed {
                peer_id: peer_id.clone(),
            });
        }
    }

    /// Refresh a peer's liveness. Unknown peers are ignored: radio
    /// callbacks may race with removal.
    pub fn update_peer_last_seen(&self, peer_id: &PeerId) {
        let now = self.inner.clock.now();
        let mut table = self.inner.table();
        if let Some(record) = table.records.get_mut(peer_id) {
            record.touch(now);
            if !record.reported_active {
                record.reported_active = true;
                self.inner.emit(PresenceEvent::BecameActive {
                    peer_id: peer_id.clone(),
                });
            }
        }
    }

    /// Store the last-known signal strength of a peer.
    ///
    /// The radio may report a peer before its announcement arrives; the
    /// value is then kept until [`add_or_update_peer`](Self::add_or_update_peer)
    /// creates the record.
    pub fn update_peer_rssi(&self, peer_id: &PeerId, rssi: i32) {
        let now = self.inner.clock.now();
        let mut table = self.inner.table();
        let table = &mut *table;
        match table.records.get_mut(peer_id) {
            Some(record) => record.rssi = Some(rssi),
            None => {
                table
                    .pending
                    .entry(peer_id.clone())
                    .or_insert_with(|| PendingMeta::new(now))
                    .rssi = Some(rssi);
            }
        }
    }

    /// Rename a known peer without refreshing its liveness.
    ///
    /// Returns whether the nickname changed.
    pub fn update_peer_nickname(&self, peer_id: &PeerId, nickname: &str) -> bool {
        let mut table = self.inner.table();
        let Some(record) = table.records.get_mut(peer_id) else {
            return false;
        };
        if record.nickname.as_deref() == Some(nickname) {
            return false;
        }
        let previous = record.nickname.replace(nickname.to_string());
        self.inner.emit(PresenceEvent::NicknameChanged {
            peer_id: peer_id.clone(),
            previous,
            nickname: nickname.to_string(),
        });
        true
    }

    /// Record that this device has sent its announcement to `peer_id`.
    ///
    /// Kept even when the peer has not announced itself yet.
    pub fn mark_peer_as_announced_to(&self, peer_id: &PeerId) {
        let now = self.inner.clock.now();
        let mut table = self.inner.table();
        let table = &mut *table;
        match table.records.get_mut(peer_id) {
            Some(record) => record.announced_to = true,
            None => {
                table
                    .pending
                    .entry(peer_id.clone())
                    .or_insert_with(|| PendingMeta::new(now))
                    .announced_to = true;
            }
        }
    }

    pub fn has_announced_to_peer(&self, peer_id: &PeerId) -> bool {
        let table = self.inner.table();
        match table.records.get(peer_id) {
            Some(record) => record.announced_to,
            None => table
                .pending
                .get(peer_id)
                .is_some_and(|meta| meta.announced_to),
        }
    }

    /// Present and not stale.
    pub fn is_peer_active(&self, peer_id: &PeerId) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .table()
            .records
            .get(peer_id)
            .map(|record| self.inner.is_fresh(record, now))
            .unwrap_or(false)
    }

    pub fn active_peer_count(&self) -> usize {
        let now = self.inner.clock.now();
        self.inner
            .table()
            .records
            .values()
            .filter(|record| self.inner.is_fresh(record, now))
            .count()
    }

    /// Sorted ids of active peers.
    pub fn active_peer_ids(&self) -> Vec<PeerId> {
        let now = self.inner.clock.now();
        let mut ids: Vec<PeerId> = self
            .inner
            .table()
            .records
            .iter()
            .filter(|(_, record)| self.inner.is_fresh(record, now))
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Records retained, active or not.
    pub fn peer_count(&self) -> usize {
        self.inner.table().records.len()
    }

    pub fn peer_nickname(&self, peer_id: &PeerId) -> Option<String> {
        self.inner
            .table()
            .records
            .get(peer_id)
            .and_then(|record| record.nickname.clone())
    }

    /// Nicknames of all retained peers, stale ones included.
    pub fn all_peer_nicknames(&self) -> HashMap<PeerId, String> {
        self.inner
            .table()
            .records
            .iter()
            .filter_map(|(peer_id, record)| {
                record
                    .nickname
                    .as_ref()
                    .map(|nickname| (peer_id.clone(), nickname.clone()))
            })
            .collect()
    }

    /// Last-known signal strength of every peer that reported one, including
    /// peers that have not announced themselves yet.
    pub fn all_peer_rssi(&self) -> HashMap<PeerId, i32> {
        let table = self.inner.table();
        let mut rssi: HashMap<PeerId, i32> = table
            .records
            .iter()
            .filter_map(|(peer_id, record)| record.rssi.map(|rssi| (peer_id.clone(), rssi)))
            .collect();
        rssi.extend(
            table
                .pending
                .iter()
                .filter_map(|(peer_id, meta)| meta.rssi.map(|value| (peer_id.clone(), value))),
        );
        rssi
    }

    pub fn peer_snapshot(&self, peer_id: &PeerId) -> Option<PeerSnapshot> {
        let now = self.inner.clock.now();
        self.inner
            .table()
            .records
            .get(peer_id)
            .map(|record| self.snapshot_of(peer_id, record, now))
    }

    /// Snapshot of every retained record, sorted by peer id.
    pub fn debug_snapshot(&self) -> Vec<PeerSnapshot> {
        let now = self.inner.clock.now();
        let mut snapshots: Vec<PeerSnapshot> = self
            .inner
            .table()
            .records
            .iter()
            .map(|(peer_id, record)| self.snapshot_of(peer_id, record, now))
            .collect();
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    fn snapshot_of(&self, peer_id: &PeerId, record: &PeerRecord, now: Instant) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: peer_id.clone(),
            nickname: record.nickname.clone(),
            rssi: record.rssi,
            announced_to: record.announced_to,
            active: self.inner.is_fresh(record, now),
            last_seen_age: record.age(now),
            known_for: now.saturating_duration_since(record.first_seen_at),
        }
    }

    /// Drop every record, including announcement state.
    pub fn clear_all_peers(&self) {
        let mut table = self.inner.table();
        let cleared = table.clear();
        tracing::debug!(cleared, "peer registry cleared");
        self.inner.emit(PresenceEvent::Cleared);
    }

    /// Run one staleness pass now.
    pub fn sweep(&self) -> SweepReport {
        self.inner.sweep()
    }

    /// Start the periodic staleness sweep on the current Tokio runtime.
    pub fn start_sweeper(&self) -> MeshResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| MeshError::NoRuntime(e.to_string()))?;

        let mut slot = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(MeshError::SweeperRunning);
        }

        let period = self.inner.config.sweep_interval();
        *slot = Some(sweeper::spawn(&handle, Arc::downgrade(&self.inner), period));
        tracing::info!(period_secs = period.as_secs(), "staleness sweeper started");
        Ok(())
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Cancel the sweeper and clear all state.
    ///
    /// Afterwards the registry behaves as freshly constructed; it can be
    /// repopulated and the sweeper restarted.
    pub fn shutdown(&self) {
        let task = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            tracing::info!("staleness sweeper stopped");
        }
        self.clear_all_peers();
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peer_count())
            .field("sweeper_running", &self.is_sweeper_running())
            .finish()
    }
}
