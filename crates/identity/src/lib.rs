//! Identity management for the Murmur mesh messenger.
//!
//! This crate owns the device's long-term key material and the fixed-format
//! public identity bundle that other devices use to authenticate it.
//!
//! # Core Concepts
//!
//! - **Identity Key Pair**: Ed25519 signing key plus X25519 key-agreement key,
//!   generated once per installation
//! - **Public Identity Bundle**: fixed-length, versioned, self-signed encoding
//!   of the public halves
//! - **Secure Storage**: platform-supplied capability for persisting the key
//!   pair, with irreversible delete for emergency wipe
//!
//! # Security Model
//!
//! - Secrets never leave the key store; callers sign and agree through it
//! - All key material is zeroized on drop and on wipe
//! - Bundles are verified before any key inside them is trusted

pub mod bundle;
pub mod error;
pub mod keystore;
pub mod storage;

pub use bundle::{
    IdentityFingerprint, PublicIdentityBundle, BUNDLE_LEN, BUNDLE_VERSION, SIGNATURE_LEN,
};
pub use error::{IdentityError, IdentityResult, StorageError, StorageResult};
pub use keystore::{IdentityKeyPair, IdentityKeyStore};
pub use storage::{FileSecureStorage, InMemorySecureStorage, SecureStorage};
