//! Handshake offers and session key agreement.
//!
//! The handshake is symmetric: each side sends exactly one offer and derives
//! the key once it holds the peer's offer. No side is "initiator".
//!
//! # Offer layout (version 1, 261 bytes)
//!
//! ```text
//! offset  len  field
//! 0       129  sender's public identity bundle
//! 129     32   ephemeral X25519 public key
//! 161     32   random nonce
//! 193     4    proposed generation (u32 big-endian)
//! 197     64   Ed25519 signature over CONTEXT || bytes[0..197] || recipient fingerprint
//! ```
//!
//! Signing over the recipient's fingerprint binds an offer to one
//! conversation; it cannot be replayed towards a third device.
//!
//! # Key schedule
//!
//! Roles are fixed by comparing the two bundles byte-wise. With `L` the lower
//! bundle and `H` the higher one, both sides feed
//! `DH(L.static, H.ephemeral) || DH(L.ephemeral, H.static) || DH(L.ephemeral, H.ephemeral)`
//! and the transcript hash of `offer(L) || offer(H)` into the BLAKE3 key
//! derivation.

use std::cmp::Ordering;
use std::fmt;

use murmur_crypto::{derive_session_key, EphemeralKeyPair, SessionKey, Transcript};
use murmur_identity::{
    IdentityFingerprint, IdentityKeyPair, PublicIdentityBundle, BUNDLE_LEN, SIGNATURE_LEN,
};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::error::{SessionError, SessionResult};

/// Length of the ephemeral key and nonce fields.
pub const OFFER_KEY_LEN: usize = 32;

/// Encoded offer length.
pub const OFFER_LEN: usize = BUNDLE_LEN + OFFER_KEY_LEN + OFFER_KEY_LEN + 4 + SIGNATURE_LEN;

const EPHEMERAL_OFFSET: usize = BUNDLE_LEN;
const NONCE_OFFSET: usize = EPHEMERAL_OFFSET + OFFER_KEY_LEN;
const GENERATION_OFFSET: usize = NONCE_OFFSET + OFFER_KEY_LEN;
const SIGNATURE_OFFSET: usize = GENERATION_OFFSET + 4;

/// Domain separation for offer signatures.
const OFFER_SIGNING_CONTEXT: &[u8] = b"murmur-handshake-offer-v1";

/// Transcript protocol label.
const TRANSCRIPT_LABEL: &str = "murmur-handshake-v1";

/// One side's contribution to a handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    /// Sender's identity
    pub bundle: PublicIdentityBundle,

    /// Sender's ephemeral X25519 public key
    #[serde(with = "hex_array")]
    pub ephemeral: [u8; OFFER_KEY_LEN],

    /// Fresh random nonce
    #[serde(with = "hex_array")]
    pub nonce: [u8; OFFER_KEY_LEN],

    /// Generation the sender proposes for the resulting session
    pub generation: u32,

    /// Sender's signature binding the fields above to the recipient
    #[serde(with = "hex_array")]
    pub signature: [u8; SIGNATURE_LEN],
}

impl HandshakeOffer {
    /// Build and sign an offer addressed to `recipient`.
    pub(crate) fn sign(
        keys: &IdentityKeyPair,
        ephemeral: &X25519PublicKey,
        nonce: [u8; OFFER_KEY_LEN],
        generation: u32,
        recipient: &IdentityFingerprint,
    ) -> Self {
        let mut offer = Self {
            bundle: keys.bundle().clone(),
            ephemeral: *ephemeral.as_bytes(),
            nonce,
            generation,
            signature: [0u8; SIGNATURE_LEN],
        };
        offer.signature = keys.sign(&offer.signed_message(recipient));
        offer
    }

    /// Verify the sender's bundle and the offer signature for `recipient`.
    pub fn verify(&self, recipient: &IdentityFingerprint) -> SessionResult<()> {
        self.bundle
            .verify()
            .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;
        self.bundle
            .verify_message(&self.signed_message(recipient), &self.signature)
            .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))
    }

    pub fn ephemeral_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.ephemeral)
    }

    /// Fixed-layout encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(OFFER_LEN);
        self.write_body(&mut bytes);
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    /// Parse a fixed-layout offer. Does not verify it.
    pub fn from_bytes(bytes: &[u8]) -> SessionResult<Self> {
        if bytes.len() != OFFER_LEN {
            return Err(SessionError::MalformedOffer(format!(
                "expected {} bytes, got {}",
                OFFER_LEN,
                bytes.len()
            )));
        }

        let bundle = PublicIdentityBundle::from_bytes(&bytes[..EPHEMERAL_OFFSET])
            .map_err(|e| SessionError::MalformedBundle(e.to_string()))?;

        let mut ephemeral = [0u8; OFFER_KEY_LEN];
        ephemeral.copy_from_slice(&bytes[EPHEMERAL_OFFSET..NONCE_OFFSET]);
        let mut nonce = [0u8; OFFER_KEY_LEN];
        nonce.copy_from_slice(&bytes[NONCE_OFFSET..GENERATION_OFFSET]);
        let mut generation = [0u8; 4];
        generation.copy_from_slice(&bytes[GENERATION_OFFSET..SIGNATURE_OFFSET]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[SIGNATURE_OFFSET..]);

        Ok(Self {
            bundle,
            ephemeral,
            nonce,
            generation: u32::from_be_bytes(generation),
            signature,
        })
    }

    fn write_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.bundle.as_bytes());
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.generation.to_be_bytes());
    }

    fn signed_message(&self, recipient: &IdentityFingerprint) -> Vec<u8> {
        let mut message = Vec::with_capacity(OFFER_SIGNING_CONTEXT.len() + SIGNATURE_OFFSET + 32);
        message.extend_from_slice(OFFER_SIGNING_CONTEXT);
        self.write_body(&mut message);
        message.extend_from_slice(recipient.as_bytes());
        message
    }
}

impl fmt::Debug for HandshakeOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeOffer")
            .field("sender", &self.bundle.fingerprint())
            .field("ephemeral", &hex::encode(self.ephemeral))
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Derive the session key from our half of the handshake and the peer's
/// verified offer.
pub(crate) fn agree(
    keys: &IdentityKeyPair,
    ephemeral: &EphemeralKeyPair,
    local: &HandshakeOffer,
    remote: &HandshakeOffer,
) -> SessionResult<SessionKey> {
    let local_is_low = match local.bundle.as_bytes().cmp(remote.bundle.as_bytes()) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => {
            return Err(SessionError::AuthenticationFailed(
                "offer carries our own identity".to_string(),
            ))
        }
    };

    let remote_ephemeral = remote.ephemeral_key();
    let static_ephemeral = keys
        .agree(&remote_ephemeral)
        .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;
    let ephemeral_static = ephemeral
        .diffie_hellman(&remote.bundle.key_agreement_key())
        .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;
    let ephemeral_ephemeral = ephemeral
        .diffie_hellman(&remote_ephemeral)
        .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;

    let (low, high, dh_outputs) = if local_is_low {
        (local, remote, [&static_ephemeral, &ephemeral_static, &ephemeral_ephemeral])
    } else {
        (remote, local, [&ephemeral_static, &static_ephemeral, &ephemeral_ephemeral])
    };

    let transcript = Transcript::new(TRANSCRIPT_LABEL)
        .append("low-offer", &low.to_bytes())
        .append("high-offer", &high.to_bytes())
        .finalize();

    Ok(derive_session_key(&dh_outputs, &transcript))
}

/// Serde adapter encoding fixed-size byte arrays as hex strings.
mod hex_array {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::invalid_length(len, &"a fixed-length hex string"))
    }
}
