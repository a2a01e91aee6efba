//! X25519 key agreement and transcript-bound session key derivation.
//!
//! A Murmur session key is derived from three Diffie-Hellman outputs (static
//! and ephemeral keys of both parties) together with a BLAKE3 hash of the
//! full handshake transcript. Public material alone never determines the key:
//! an observer holding both identity bundles and both handshake offers still
//! lacks every DH input.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};

/// Length of an X25519 public key.
pub const KEY_AGREEMENT_PUBLIC_LEN: usize = 32;

/// Length of a derived session key.
pub const SESSION_KEY_LEN: usize = 32;

/// BLAKE3 derive_key context for session keys.
const SESSION_KEY_CONTEXT: &str = "murmur-mesh 2024-06 session key v1";

/// BLAKE3 derive_key context for the loggable session key identifier.
const SESSION_KEY_ID_CONTEXT: &str = "murmur-mesh 2024-06 session key id v1";

/// Per-handshake X25519 key pair.
///
/// Backed by a `StaticSecret` because a handshake uses the ephemeral secret
/// in two agreements. The secret is zeroized on drop and the pair is never
/// reused across handshakes.
pub struct EphemeralKeyPair {
    pub public: X25519PublicKey,
    secret: StaticSecret,
}

impl EphemeralKeyPair {
    /// Generate a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Compute the shared secret with a peer's public key.
    ///
    /// Rejects low-order peer keys that would yield an all-zero secret.
    pub fn diffie_hellman(&self, peer_public: &X25519PublicKey) -> CryptoResult<SharedSecret> {
        contributory(self.secret.diffie_hellman(peer_public))
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Reject non-contributory agreement results.
pub fn contributory(shared: SharedSecret) -> CryptoResult<SharedSecret> {
    if shared.was_contributory() {
        Ok(shared)
    } else {
        Err(CryptoError::InvalidKey(
            "non-contributory key agreement".to_string(),
        ))
    }
}

/// Parse a 32-byte X25519 public key.
pub fn public_key_from_slice(bytes: &[u8]) -> CryptoResult<X25519PublicKey> {
    let array: [u8; KEY_AGREEMENT_PUBLIC_LEN] = bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "expected {} byte X25519 key, got {}",
            KEY_AGREEMENT_PUBLIC_LEN,
            bytes.len()
        ))
    })?;
    Ok(X25519PublicKey::from(array))
}

/// Incremental, length-prefixed transcript hash.
///
/// Every appended field is framed with its label and length so that
/// distinct field sequences can never hash to the same transcript.
#[derive(Clone)]
pub struct Transcript {
    hasher: blake3::Hasher,
}

impl Transcript {
    pub fn new(protocol_label: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(protocol_label.len() as u32).to_le_bytes());
        hasher.update(protocol_label.as_bytes());
        Self { hasher }
    }

    pub fn append(&mut self, label: &str, data: &[u8]) -> &mut Self {
        self.hasher.update(&(label.len() as u32).to_le_bytes());
        self.hasher.update(label.as_bytes());
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.hasher.finalize().as_bytes()
    }
}

/// Symmetric key for one session generation. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Short public identifier of this key, safe to log.
    ///
    /// Both parties of a successful handshake compute the same identifier.
    pub fn key_id(&self) -> String {
        let id = blake3::derive_key(SESSION_KEY_ID_CONTEXT, &self.0);
        hex::encode(&id[..8])
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({})", self.key_id())
    }
}

/// Derive a session key from ordered DH outputs and a transcript hash.
///
/// Callers must pass the DH outputs in the same role-normalized order on
/// both sides of the handshake.
pub fn derive_session_key(dh_outputs: &[&SharedSecret], transcript_hash: &[u8; 32]) -> SessionKey {
    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KEY_CONTEXT);
    for shared in dh_outputs {
        hasher.update(shared.as_bytes());
    }
    hasher.update(transcript_hash);
    SessionKey(*hasher.finalize().as_bytes())
}
