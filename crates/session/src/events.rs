//! Session notifications for the upper messaging layer.

use murmur_core::PeerId;
use serde::{Deserialize, Serialize};

/// Why a session was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// Explicit `revoke` call
    Requested,
    /// The peer was removed from the registry
    PeerRemoved,
    /// The local identity was wiped
    IdentityWiped,
}

/// A change in session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// First session with a peer (or first after revocation)
    Established {
        peer_id: PeerId,
        generation: u32,
        key_id: String,
    },

    /// A rotation completed; `previous` stays decryptable for the grace window
    Rotated {
        peer_id: PeerId,
        previous: u32,
        generation: u32,
        key_id: String,
    },

    /// All session material for the peer was dropped
    Revoked {
        peer_id: PeerId,
        reason: RevocationReason,
    },

    /// A handshake was rejected or abandoned
    HandshakeFailed { peer_id: PeerId, reason: String },
}

impl SessionEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Established { peer_id, .. }
            | Self::Rotated { peer_id, .. }
            | Self::Revoked { peer_id, .. }
            | Self::HandshakeFailed { peer_id, .. } => peer_id,
        }
    }
}
