//! Cryptographic primitives for the Murmur mesh messenger.
//!
//! This crate holds the stateless building blocks the Session Establisher
//! composes: ephemeral X25519 key pairs, transcript hashing, session key
//! derivation and the per-generation AEAD cipher.
//!
//! # Supported Algorithms
//!
//! - **Key Exchange**: X25519 (Diffie-Hellman)
//! - **Key Derivation / Hashing**: BLAKE3 (`derive_key` mode)
//! - **Encryption**: ChaCha20-Poly1305
//!
//! # Security Principles
//!
//! - Never roll custom cryptographic primitives
//! - Secrets must never be logged; debug output shows public values only
//! - Key material is zeroized on drop

pub mod agreement;
pub mod error;
pub mod session;

pub use agreement::{
    contributory, derive_session_key, public_key_from_slice, EphemeralKeyPair, SessionKey,
    Transcript, KEY_AGREEMENT_PUBLIC_LEN, SESSION_KEY_LEN,
};
pub use error::{CryptoError, CryptoResult};
pub use session::{
    frame_generation, SessionCipher, GENERATION_HEADER_SIZE, MAX_GENERATION_AGE_SECS,
    MAX_MESSAGES_PER_GENERATION, MIN_FRAME_SIZE, NONCE_SIZE, TAG_SIZE,
};

/// Fill an array with bytes from the OS RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_differ() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
        assert_ne!(a, [0u8; 32]);
    }
}
