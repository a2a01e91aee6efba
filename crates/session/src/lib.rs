//! Murmur Session - Authenticated per-peer sessions
//!
//! Turns a verified peer identity into a symmetric session key and owns the
//! resulting ciphers.
//!
//! # Protocol Flow
//!
//! 1. Both devices call [`SessionEstablisher::begin_handshake`] with the
//!    other's identity bundle and send the returned [`HandshakeOffer`]
//! 2. Each device passes the offer it received to
//!    [`SessionEstablisher::complete_handshake`]
//! 3. Both now hold the same key and exchange frames through
//!    [`SessionEstablisher::encrypt`] / [`SessionEstablisher::decrypt`]
//!
//! # Security Properties
//!
//! - Mutual authentication: every offer is signed by the sender's long-term
//!   key and addressed to the recipient's fingerprint
//! - Forward secrecy per generation: each handshake uses fresh ephemeral keys
//! - Rotation keeps the superseded generation only for a bounded grace window
//! - Sessions die with the identity that created them

pub mod error;
pub mod establisher;
pub mod events;
pub mod handshake;
pub mod state;

pub use error::{SessionError, SessionResult};
pub use establisher::SessionEstablisher;
pub use events::{RevocationReason, SessionEvent};
pub use handshake::{HandshakeOffer, OFFER_LEN};
pub use state::{SessionInfo, SessionStateKind, SessionStats};
