//! Error types for Murmur session operations.
//!
//! Every error is scoped to the single peer and operation that raised it;
//! other peers' sessions and the registry are unaffected.

use murmur_crypto::CryptoError;
use murmur_identity::IdentityError;
use thiserror::Error;

/// Errors that can occur in session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Received identity bundle has the wrong size or version
    #[error("Malformed identity bundle: {0}")]
    MalformedBundle(String),

    /// Handshake offer has the wrong size or framing
    #[error("Malformed handshake offer: {0}")]
    MalformedOffer(String),

    /// Peer identity could not be verified
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A handshake for this peer is already in flight
    #[error("Handshake already in progress for peer {0}")]
    HandshakeInProgress(String),

    /// No usable session for this peer
    #[error("No session for peer {0}")]
    NoSession(String),

    /// Frame could not be authenticated under any live generation
    #[error("Decryption failed")]
    DecryptionFailed,

    /// `complete_handshake` without a matching `begin_handshake`
    #[error("No handshake in flight for peer {0}")]
    NoHandshake(String),

    /// The in-flight handshake exceeded the configured timeout
    #[error("Handshake timed out for peer {0}")]
    HandshakeTimedOut(String),

    /// Generation counter for this peer cannot advance further
    #[error("Session generations exhausted for peer {0}")]
    GenerationExhausted(String),

    /// Local identity unavailable
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Primitive failure
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
