//! Periodic staleness sweep.
//!
//! The task holds only a weak reference to the registry, so dropping the last
//! [`PeerRegistry`](crate::PeerRegistry) handle ends it even without an
//! explicit shutdown.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::peer::RegistryInner;

pub(crate) fn spawn(handle: &Handle, registry: Weak<RegistryInner>, period: Duration) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                tracing::debug!("peer registry dropped, sweeper exiting");
                break;
            };
            registry.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use murmur_core::{Clock, ManualClock, PeerId, RegistryConfig};

    use crate::{MeshError, PeerRegistry, PresenceEvent};

    fn registry_with_clock() -> (Arc<ManualClock>, PeerRegistry) {
        let clock = Arc::new(ManualClock::new());
        let config = RegistryConfig {
            sweep_interval_secs: 60,
            ..RegistryConfig::default()
        };
        let registry = PeerRegistry::with_clock(config, clock.clone() as Arc<dyn Clock>);
        (clock, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_emits_inactive() {
        let (clock, registry) = registry_with_clock();
        let peer = PeerId::from("peer1");
        registry.add_or_update_peer(&peer, "alice");
        let mut events = registry.subscribe();
        assert!(events.try_recv().is_err());

        registry.start_sweeper().unwrap();
        clock.advance(std::time::Duration::from_secs(181));
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event, PresenceEvent::BecameInactive { peer_id: peer });
        registry.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let (_, registry) = registry_with_clock();
        registry.start_sweeper().unwrap();
        assert!(matches!(registry.start_sweeper(), Err(MeshError::SweeperRunning)));
        assert!(registry.is_sweeper_running());

        registry.shutdown();
        assert!(!registry.is_sweeper_running());
        registry.start_sweeper().unwrap();
        registry.shutdown();
    }
}
