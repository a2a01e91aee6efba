//! Presence notifications for the upper messaging layer.

use murmur_core::PeerId;
use serde::{Deserialize, Serialize};

/// A change in peer presence or metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// First contact with a peer
    Joined {
        peer_id: PeerId,
        nickname: String,
    },

    /// A known peer announced a different nickname
    NicknameChanged {
        peer_id: PeerId,
        previous: Option<String>,
        nickname: String,
    },

    /// A stale peer was heard from again
    BecameActive { peer_id: PeerId },

    /// A peer crossed the staleness threshold; its record is retained
    BecameInactive { peer_id: PeerId },

    /// A record was deleted (radio disconnect or retention expiry)
    Removed { peer_id: PeerId },

    /// All records were dropped
    Cleared,
}

impl PresenceEvent {
    /// The peer this event concerns, `None` for registry-wide events.
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::Joined { peer_id, .. }
            | Self::NicknameChanged { peer_id, .. }
            | Self::BecameActive { peer_id }
            | Self::BecameInactive { peer_id }
            | Self::Removed { peer_id } => Some(peer_id),
            Self::Cleared => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = PresenceEvent::BecameInactive {
            peer_id: PeerId::from("peer1"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "became_inactive");
        assert_eq!(json["peer_id"], "peer1");
    }

    #[test]
    fn test_peer_id_accessor() {
        let removed = PresenceEvent::Removed {
            peer_id: PeerId::from("peer2"),
        };
        assert_eq!(removed.peer_id().map(PeerId::as_str), Some("peer2"));
        assert!(PresenceEvent::Cleared.peer_id().is_none());
    }
}
