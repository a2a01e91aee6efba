//! Per-generation session cipher with ChaCha20-Poly1305 AEAD.
//!
//! Each session generation owns one [`SessionCipher`]. Sealed messages carry
//! their generation in a cleartext header so the receiver can pick the right
//! key while a rotation is in progress.
//!
//! # Frame Layout
//!
//! ```text
//! +----------------+-------------+-------------------------------+
//! | generation u32 | nonce (12)  | ciphertext || Poly1305 tag   |
//! |   big endian   |             |                               |
//! +----------------+-------------+-------------------------------+
//! ```
//!
//! The 4-byte generation header is bound as associated data, so a frame
//! relabelled with another generation fails authentication.
//!
//! # Rotation Policy
//!
//! A generation should be rotated after a configurable number of sealed
//! messages or a configurable lifetime, whichever comes first. The cipher
//! only reports the condition; rotation itself is a new key agreement.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce as ChaCha20Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::time::{Duration, Instant};

use crate::agreement::SessionKey;
use crate::error::{CryptoError, CryptoResult};

/// Maximum number of messages before rotation is advised.
pub const MAX_MESSAGES_PER_GENERATION: u64 = 10_000;

/// Maximum generation lifetime before rotation is advised (1 hour).
pub const MAX_GENERATION_AGE_SECS: u64 = 3600;

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;

/// Generation header size.
pub const GENERATION_HEADER_SIZE: usize = 4;

/// Smallest well-formed frame: header, nonce and tag around an empty message.
pub const MIN_FRAME_SIZE: usize = GENERATION_HEADER_SIZE + NONCE_SIZE + TAG_SIZE;

/// Read the generation header of a sealed frame.
pub fn frame_generation(frame: &[u8]) -> CryptoResult<u32> {
    if frame.len() < MIN_FRAME_SIZE {
        return Err(CryptoError::Truncated {
            expected: MIN_FRAME_SIZE,
            actual: frame.len(),
        });
    }
    let mut header = [0u8; GENERATION_HEADER_SIZE];
    header.copy_from_slice(&frame[..GENERATION_HEADER_SIZE]);
    Ok(u32::from_be_bytes(header))
}

/// AEAD state for one session generation.
pub struct SessionCipher {
    /// ChaCha20-Poly1305 instance keyed for this generation
    cipher: ChaCha20Poly1305,

    /// Generation number carried in every frame header
    generation: u32,

    /// Messages sealed under this generation
    messages_sealed: u64,

    /// Messages successfully opened under this generation
    messages_opened: u64,

    /// When this generation was keyed
    created_at: Instant,

    /// Maximum messages before rotation is advised
    max_messages: u64,

    /// Maximum lifetime before rotation is advised
    max_age: Duration,
}

impl SessionCipher {
    /// Key a new generation.
    pub fn new(key: &SessionKey, generation: u32, created_at: Instant) -> Self {
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()));

        Self {
            cipher,
            generation,
            messages_sealed: 0,
            messages_opened: 0,
            created_at,
            max_messages: MAX_MESSAGES_PER_GENERATION,
            max_age: Duration::from_secs(MAX_GENERATION_AGE_SECS),
        }
    }

    /// Override the rotation thresholds.
    pub fn with_limits(mut self, max_messages: u64, max_age: Duration) -> Self {
        self.max_messages = max_messages;
        self.max_age = max_age;
        self
    }

    /// Whether this generation has reached a rotation threshold at `now`.
    pub fn rotation_required(&self, now: Instant) -> bool {
        self.messages_sealed >= self.max_messages
            || now.saturating_duration_since(self.created_at) >= self.max_age
    }

    /// Encrypt and frame `plaintext`.
    pub fn seal(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let header = self.generation.to_be_bytes();

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = ChaCha20Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut frame =
            Vec::with_capacity(GENERATION_HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(&ciphertext);

        self.messages_sealed += 1;

        Ok(frame)
    }

    /// Authenticate and decrypt a frame sealed under this generation.
    pub fn open(&mut self, frame: &[u8]) -> CryptoResult<Vec<u8>> {
        if frame_generation(frame)? != self.generation {
            return Err(CryptoError::Decryption);
        }

        let (header, rest) = frame.split_at(GENERATION_HEADER_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);
        let nonce = ChaCha20Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| {
                tracing::trace!(generation = self.generation, "frame failed authentication");
                CryptoError::Decryption
            })?;

        self.messages_opened += 1;

        Ok(plaintext)
    }

    /// Generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Messages sealed under this generation.
    pub fn messages_sealed(&self) -> u64 {
        self.messages_sealed
    }

    /// Messages opened under this generation.
    pub fn messages_opened(&self) -> u64 {
        self.messages_opened
    }

    /// When this generation was keyed.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("generation", &self.generation)
            .field("messages_sealed", &self.messages_sealed)
            .field("messages_opened", &self.messages_opened)
            .finish_non_exhaustive()
    }
}
