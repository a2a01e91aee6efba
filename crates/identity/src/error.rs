//! Error types for Murmur identity operations.
//!
//! Storage failures while establishing the identity are fatal to startup:
//! without a stable identity no peer can authenticate this device.

use thiserror::Error;

/// Errors raised by the secure-storage capability.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend I/O failure
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record name unusable by this backend
    #[error("Invalid record name: {0}")]
    InvalidName(String),

    /// Backend-specific failure (platform keystore, enclave, ...)
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// `ensure_identity` has not run, or the identity was wiped
    #[error("Identity not initialized")]
    NotInitialized,

    /// Secure storage failed
    #[error("Secure storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stored identity record could not be decoded
    #[error("Corrupt identity record: {0}")]
    CorruptRecord(String),

    /// Identity bundle of wrong length or unknown version
    #[error("Malformed identity bundle: {0}")]
    MalformedBundle(String),

    /// Bundle or message signature did not verify
    #[error("Signature verification failed: {0}")]
    InvalidSignature(String),

    /// Key material rejected by a primitive
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] murmur_crypto::CryptoError),

    /// Record serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key store lock poisoned by a panicking holder
    #[error("Key store lock poisoned")]
    LockPoisoned,
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Result type for secure-storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
