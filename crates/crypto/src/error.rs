//! Error types for Murmur cryptographic primitives.

use thiserror::Error;

/// Errors raised by the primitive layer.
///
/// Messages never include key material or plaintext.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD sealing failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Authentication tag mismatch or otherwise unopenable frame
    #[error("Decryption failed")]
    Decryption,

    /// Input shorter than the fixed framing requires
    #[error("Truncated input: need at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Key bytes of the wrong size or a degenerate agreement result
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
