//! Murmur Mesh - Peer presence for the radio mesh
//!
//! Tracks which radio-adjacent peers are currently reachable, their
//! nicknames, signal strength and whether this device has announced itself
//! to them.
//!
//! # Core Components
//!
//! - **Peer Registry**: concurrent map of liveness records with derived activity
//! - **Staleness Sweeper**: periodic task that reports peers going quiet
//! - **Presence Events**: broadcast notifications for the messaging layer
//!
//! # Example Usage
//!
//! ```rust
//! use murmur_core::{PeerId, RegistryConfig};
//! use murmur_mesh::PeerRegistry;
//!
//! let registry = PeerRegistry::new(RegistryConfig::default());
//! let peer = PeerId::from("a1b2c3d4");
//!
//! assert!(registry.add_or_update_peer(&peer, "alice"));
//! registry.update_peer_rssi(&peer, -61);
//! assert!(registry.is_peer_active(&peer));
//! assert_eq!(registry.active_peer_count(), 1);
//! ```

pub mod error;
pub mod events;
pub mod peer;
mod sweeper;

pub use error::{MeshError, MeshResult};
pub use events::PresenceEvent;
pub use peer::{PeerRegistry, PeerSnapshot, SweepReport};
