//! Public identity bundle wire format.
//!
//! The bundle is the only identity datum exchanged between devices. Its
//! length is fixed per protocol version; every interoperating instance must
//! agree on it, so [`BUNDLE_LEN`] never varies for a given [`BUNDLE_VERSION`].
//!
//! # Layout (version 1, 129 bytes)
//!
//! ```text
//! offset  len  field
//! 0       1    protocol version tag (0x01)
//! 1       32   X25519 key-agreement public key
//! 33      32   Ed25519 verifying key
//! 65      64   Ed25519 signature over CONTEXT || bytes[0..65]
//! ```
//!
//! The self-signature binds the key-agreement key to the signing identity,
//! so a relay cannot splice its own agreement key under someone else's
//! signing key.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::error::{IdentityError, IdentityResult};

/// Current bundle protocol version.
pub const BUNDLE_VERSION: u8 = 1;

/// Bundle length for [`BUNDLE_VERSION`].
pub const BUNDLE_LEN: usize = 129;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

const AGREEMENT_KEY_OFFSET: usize = 1;
const VERIFYING_KEY_OFFSET: usize = 33;
const SIGNATURE_OFFSET: usize = 65;

/// Domain separation for the bundle self-signature.
const BUNDLE_SIGNING_CONTEXT: &[u8] = b"murmur-identity-bundle-v1";

/// BLAKE3 hash of a bundle, used for out-of-band verification and to bind
/// sessions to the identities that created them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityFingerprint([u8; 32]);

impl IdentityFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for IdentityFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdentityFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityFingerprint({})", self.short())
    }
}

impl Serialize for IdentityFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Fixed-length encoding of this device's public identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicIdentityBundle([u8; BUNDLE_LEN]);

impl PublicIdentityBundle {
    /// Build and self-sign a bundle for the given key pair halves.
    pub(crate) fn create(signing_key: &SigningKey, agreement_public: &X25519PublicKey) -> Self {
        let mut bytes = [0u8; BUNDLE_LEN];
        bytes[0] = BUNDLE_VERSION;
        bytes[AGREEMENT_KEY_OFFSET..VERIFYING_KEY_OFFSET]
            .copy_from_slice(agreement_public.as_bytes());
        bytes[VERIFYING_KEY_OFFSET..SIGNATURE_OFFSET]
            .copy_from_slice(signing_key.verifying_key().as_bytes());

        let signature = signing_key.sign(&signed_message(&bytes));
        bytes[SIGNATURE_OFFSET..].copy_from_slice(&signature.to_bytes());

        Self(bytes)
    }

    /// Parse a received bundle, checking length and version only.
    ///
    /// Call [`verify`](Self::verify) before trusting the keys inside.
    pub fn from_bytes(bytes: &[u8]) -> IdentityResult<Self> {
        if bytes.len() != BUNDLE_LEN {
            return Err(IdentityError::MalformedBundle(format!(
                "expected {} bytes, got {}",
                BUNDLE_LEN,
                bytes.len()
            )));
        }
        if bytes[0] != BUNDLE_VERSION {
            return Err(IdentityError::MalformedBundle(format!(
                "unsupported bundle version {} (expected {})",
                bytes[0], BUNDLE_VERSION
            )));
        }

        let mut array = [0u8; BUNDLE_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; BUNDLE_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn version(&self) -> u8 {
        self.0[0]
    }

    /// X25519 static public key.
    pub fn key_agreement_key(&self) -> X25519PublicKey {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[AGREEMENT_KEY_OFFSET..VERIFYING_KEY_OFFSET]);
        X25519PublicKey::from(key)
    }

    /// Ed25519 verifying key.
    pub fn verifying_key(&self) -> IdentityResult<VerifyingKey> {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[VERIFYING_KEY_OFFSET..SIGNATURE_OFFSET]);
        VerifyingKey::from_bytes(&key)
            .map_err(|e| IdentityError::InvalidSignature(format!("invalid verifying key: {}", e)))
    }

    /// Check the bundle self-signature.
    pub fn verify(&self) -> IdentityResult<()> {
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&self.0[SIGNATURE_OFFSET..]);

        self.verifying_key()?
            .verify_strict(&signed_message(&self.0), &Signature::from_bytes(&signature))
            .map_err(|_| IdentityError::InvalidSignature("bundle self-signature".to_string()))
    }

    /// Verify a detached signature made by this identity.
    pub fn verify_message(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> IdentityResult<()> {
        self.verifying_key()?
            .verify_strict(message, &Signature::from_bytes(signature))
            .map_err(|_| IdentityError::InvalidSignature("message signature".to_string()))
    }

    pub fn fingerprint(&self) -> IdentityFingerprint {
        IdentityFingerprint(*blake3::hash(&self.0).as_bytes())
    }
}

fn signed_message(bundle: &[u8; BUNDLE_LEN]) -> Vec<u8> {
    let mut message = Vec::with_capacity(BUNDLE_SIGNING_CONTEXT.len() + SIGNATURE_OFFSET);
    message.extend_from_slice(BUNDLE_SIGNING_CONTEXT);
    message.extend_from_slice(&bundle[..SIGNATURE_OFFSET]);
    message
}

impl fmt::Debug for PublicIdentityBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicIdentityBundle")
            .field("version", &self.version())
            .field("fingerprint", &self.fingerprint().short())
            .finish()
    }
}

impl AsRef<[u8]> for PublicIdentityBundle {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for PublicIdentityBundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicIdentityBundle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}
