//! Identity Key Store: the device's long-term key material.
//!
//! Holds one Ed25519 signing key and one X25519 key-agreement key for the
//! lifetime of the installation. Secrets never leave this module: callers
//! sign and agree through the store, and read only the public bundle.
//!
//! # Locking
//!
//! [`IdentityKeyStore::ensure_identity`] and [`IdentityKeyStore::wipe_all`]
//! hold the write lock for their whole duration. Signing and agreement hold
//! the read lock, so a handshake can never observe a half-wiped identity.

use ed25519_dalek::{Signer, SigningKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use murmur_core::config::{IdentityConfig, DEFAULT_IDENTITY_RECORD};

use crate::bundle::{IdentityFingerprint, PublicIdentityBundle, SIGNATURE_LEN};
use crate::error::{IdentityError, IdentityResult};
use crate::storage::SecureStorage;

/// Version of the persisted identity record.
const RECORD_VERSION: u8 = 1;

/// Persisted form of the identity. Zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredIdentity {
    version: u8,
    /// Hex-encoded Ed25519 secret seed
    signing_key: String,
    /// Hex-encoded X25519 static secret
    agreement_key: String,
    /// Creation time (Unix epoch milliseconds)
    created_at_ms: u64,
}

/// Long-term identity key pair.
///
/// Both secrets zeroize on drop.
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    agreement_key: StaticSecret,
    bundle: PublicIdentityBundle,
    created_at_ms: u64,
}

impl IdentityKeyPair {
    fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *seed);
        let signing_key = SigningKey::from_bytes(&seed);
        let agreement_key = StaticSecret::random_from_rng(OsRng);

        Self::from_parts(signing_key, agreement_key, current_timestamp_ms())
    }

    fn from_parts(signing_key: SigningKey, agreement_key: StaticSecret, created_at_ms: u64) -> Self {
        let bundle =
            PublicIdentityBundle::create(&signing_key, &X25519PublicKey::from(&agreement_key));
        Self {
            signing_key,
            agreement_key,
            bundle,
            created_at_ms,
        }
    }

    fn from_record(bytes: &[u8]) -> IdentityResult<Self> {
        let record: StoredIdentity = serde_json::from_slice(bytes)
            .map_err(|e| IdentityError::CorruptRecord(e.to_string()))?;

        if record.version != RECORD_VERSION {
            return Err(IdentityError::CorruptRecord(format!(
                "unsupported record version {}",
                record.version
            )));
        }

        let signing_seed = decode_secret(&record.signing_key, "signing_key")?;
        let agreement_secret = decode_secret(&record.agreement_key, "agreement_key")?;

        Ok(Self::from_parts(
            SigningKey::from_bytes(&signing_seed),
            StaticSecret::from(*agreement_secret),
            record.created_at_ms,
        ))
    }

    fn to_record(&self) -> IdentityResult<Zeroizing<Vec<u8>>> {
        let record = StoredIdentity {
            version: RECORD_VERSION,
            signing_key: hex::encode(self.signing_key.to_bytes()),
            agreement_key: hex::encode(self.agreement_key.to_bytes()),
            created_at_ms: self.created_at_ms,
        };
        Ok(Zeroizing::new(serde_json::to_vec(&record)?))
    }

    /// Public bundle for this key pair.
    pub fn bundle(&self) -> &PublicIdentityBundle {
        &self.bundle
    }

    pub fn fingerprint(&self) -> IdentityFingerprint {
        self.bundle.fingerprint()
    }

    /// Sign `message` with the long-term Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Static X25519 agreement with a remote public key.
    pub fn agree(&self, remote: &X25519PublicKey) -> IdentityResult<SharedSecret> {
        Ok(murmur_crypto::contributory(
            self.agreement_key.diffie_hellman(remote),
        )?)
    }

    /// Creation time (Unix epoch milliseconds).
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .field("created_at_ms", &self.created_at_ms)
            .finish_non_exhaustive()
    }
}

fn decode_secret(encoded: &str, field: &str) -> IdentityResult<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(
        hex::decode(encoded).map_err(|e| IdentityError::CorruptRecord(format!("{}: {}", field, e)))?,
    );
    let mut secret = Zeroizing::new([0u8; 32]);
    if bytes.len() != secret.len() {
        return Err(IdentityError::CorruptRecord(format!(
            "{}: expected 32 bytes, got {}",
            field,
            bytes.len()
        )));
    }
    secret.copy_from_slice(&bytes);
    Ok(secret)
}

/// Owner of the device identity, backed by a secure-storage capability.
pub struct IdentityKeyStore {
    storage: Arc<dyn SecureStorage>,
    record_name: String,
    keys: RwLock<Option<IdentityKeyPair>>,
    /// Bumped on every wipe; sessions created under an older epoch are dead
    epoch: AtomicU64,
    /// Set when a wipe could not delete the stored record. Only touched
    /// under the write lock.
    wipe_pending: AtomicBool,
}

impl IdentityKeyStore {
    /// Create a store using the default record name.
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self::with_record_name(storage, DEFAULT_IDENTITY_RECORD)
    }

    pub fn with_config(storage: Arc<dyn SecureStorage>, config: &IdentityConfig) -> Self {
        Self::with_record_name(storage, config.record_name.clone())
    }

    pub fn with_record_name(storage: Arc<dyn SecureStorage>, record_name: impl Into<String>) -> Self {
        Self {
            storage,
            record_name: record_name.into(),
            keys: RwLock::new(None),
            epoch: AtomicU64::new(0),
            wipe_pending: AtomicBool::new(false),
        }
    }

    /// Load the stored identity, or generate and persist a new one.
    ///
    /// Idempotent. Storage failures here are fatal to startup.
    pub fn ensure_identity(&self) -> IdentityResult<IdentityFingerprint> {
        let mut keys = self.keys.write().map_err(|_| IdentityError::LockPoisoned)?;

        if let Some(existing) = keys.as_ref() {
            return Ok(existing.fingerprint());
        }

        // A wiped identity must never be reloaded from storage.
        if self.wipe_pending.load(Ordering::SeqCst) {
            self.storage.delete(&self.record_name)?;
            self.wipe_pending.store(false, Ordering::SeqCst);
            tracing::warn!(record = %self.record_name, "completed interrupted identity wipe");
        }

        let identity = match self.storage.load(&self.record_name)? {
            Some(record) => {
                let identity = IdentityKeyPair::from_record(&record)?;
                tracing::info!(
                    fingerprint = %identity.fingerprint().short(),
                    "loaded device identity"
                );
                identity
            }
            None => {
                let identity = IdentityKeyPair::generate();
                self.storage
                    .save(&self.record_name, &identity.to_record()?)?;
                tracing::info!(
                    fingerprint = %identity.fingerprint().short(),
                    "generated new device identity"
                );
                identity
            }
        };

        let fingerprint = identity.fingerprint();
        *keys = Some(identity);
        Ok(fingerprint)
    }

    /// Whether an identity is loaded.
    pub fn has_identity(&self) -> bool {
        self.keys
            .read()
            .map(|keys| keys.is_some())
            .unwrap_or(false)
    }

    /// The fixed-size public identity bundle.
    ///
    /// Identical across calls for the same stored identity.
    pub fn public_identity_bundle(&self) -> IdentityResult<PublicIdentityBundle> {
        self.with_keys(|keys| keys.bundle().clone())
    }

    pub fn fingerprint(&self) -> IdentityResult<IdentityFingerprint> {
        self.with_keys(|keys| keys.fingerprint())
    }

    pub fn sign(&self, message: &[u8]) -> IdentityResult<[u8; SIGNATURE_LEN]> {
        self.with_keys(|keys| keys.sign(message))
    }

    pub fn agree(&self, remote: &X25519PublicKey) -> IdentityResult<SharedSecret> {
        self.with_keys(|keys| keys.agree(remote))?
    }

    /// Run `f` against the loaded key pair under the read lock.
    ///
    /// Several operations that must observe the same identity (sign, then
    /// agree) belong in one closure.
    pub fn with_keys<R>(&self, f: impl FnOnce(&IdentityKeyPair) -> R) -> IdentityResult<R> {
        let keys = self.keys.read().map_err(|_| IdentityError::LockPoisoned)?;
        let keys = keys.as_ref().ok_or(IdentityError::NotInitialized)?;
        Ok(f(keys))
    }

    /// Destroy the long-term key material in memory and in storage.
    ///
    /// Dependent sessions are invalidated through [`epoch`](Self::epoch).
    /// A subsequent `ensure_identity` generates a brand-new identity.
    ///
    /// In-memory keys are destroyed even when the storage delete fails. The
    /// error is returned and the delete is retried by the next
    /// `ensure_identity`, which refuses to load the old record until it
    /// succeeds.
    pub fn wipe_all(&self) -> IdentityResult<()> {
        let mut keys = self.keys.write().map_err(|_| IdentityError::LockPoisoned)?;

        let previous = keys.take();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        drop(previous);

        if let Err(e) = self.storage.delete(&self.record_name) {
            self.wipe_pending.store(true, Ordering::SeqCst);
            tracing::error!(
                record = %self.record_name,
                error = %e,
                "identity record could not be deleted; wipe pending"
            );
            return Err(e.into());
        }
        self.wipe_pending.store(false, Ordering::SeqCst);
        tracing::warn!(record = %self.record_name, "device identity wiped");
        Ok(())
    }

    /// Wipe counter; changes whenever the identity is destroyed.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn record_name(&self) -> &str {
        &self.record_name
    }
}

impl std::fmt::Debug for IdentityKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyStore")
            .field("record_name", &self.record_name)
            .field("loaded", &self.has_identity())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Get current timestamp in milliseconds
fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BUNDLE_LEN;
    use crate::error::StorageError;
    use crate::storage::{FileSecureStorage, InMemorySecureStorage};
    use crate::StorageResult;

    fn memory_store() -> (Arc<InMemorySecureStorage>, IdentityKeyStore) {
        let storage = Arc::new(InMemorySecureStorage::new());
        let store = IdentityKeyStore::new(storage.clone());
        (storage, store)
    }

    #[test]
    fn test_bundle_is_correct_size() {
        let (_, store) = memory_store();
        store.ensure_identity().unwrap();

        let bundle = store.public_identity_bundle().unwrap();
        assert_eq!(bundle.as_bytes().len(), BUNDLE_LEN);
    }

    #[test]
    fn test_bundle_is_not_empty() {
        let (_, store) = memory_store();
        store.ensure_identity().unwrap();

        let bundle = store.public_identity_bundle().unwrap();
        assert!(!bundle.to_vec().is_empty());
        assert!(bundle.as_bytes().iter().any(|b| *b != 0));
    }

    #[test]
    fn test_bundle_stable_across_calls() {
        let (_, store) = memory_store();
        store.ensure_identity().unwrap();

        let first = store.public_identity_bundle().unwrap();
        let second = store.public_identity_bundle().unwrap();
        assert_eq!(first, second);
        assert!(first.verify().is_ok());
    }

    #[test]
    fn test_bundle_before_ensure_fails() {
        let (_, store) = memory_store();
        assert!(matches!(
            store.public_identity_bundle(),
            Err(IdentityError::NotInitialized)
        ));
        assert!(!store.has_identity());
    }

    #[test]
    fn test_ensure_identity_is_idempotent() {
        let (storage, store) = memory_store();
        let a = store.ensure_identity().unwrap();
        let b = store.ensure_identity().unwrap();
        assert_eq!(a, b);
        assert!(storage.contains(DEFAULT_IDENTITY_RECORD));
    }

    #[test]
    fn test_identity_persists_across_instances() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let first = IdentityKeyStore::new(storage.clone());
        let original = first.ensure_identity().unwrap();
        let bundle = first.public_identity_bundle().unwrap();
        drop(first);

        let second = IdentityKeyStore::new(storage);
        assert_eq!(second.ensure_identity().unwrap(), original);
        assert_eq!(second.public_identity_bundle().unwrap(), bundle);
    }

    #[test]
    fn test_file_backed_identity_persists() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileSecureStorage::new(dir.path()).unwrap());

        let original = IdentityKeyStore::new(storage.clone())
            .ensure_identity()
            .unwrap();
        let reloaded = IdentityKeyStore::new(storage).ensure_identity().unwrap();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn test_wipe_generates_new_identity() {
        let (storage, store) = memory_store();
        let original = store.ensure_identity().unwrap();
        let epoch = store.epoch();

        store.wipe_all().unwrap();
        assert!(!store.has_identity());
        assert!(!storage.contains(DEFAULT_IDENTITY_RECORD));
        assert_eq!(store.epoch(), epoch + 1);
        assert!(matches!(store.sign(b"x"), Err(IdentityError::NotInitialized)));

        let replacement = store.ensure_identity().unwrap();
        assert_ne!(original, replacement);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let (storage, store) = memory_store();
        storage.save(DEFAULT_IDENTITY_RECORD, b"not json").unwrap();
        assert!(matches!(
            store.ensure_identity(),
            Err(IdentityError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_signatures_verify_against_bundle() {
        let (_, store) = memory_store();
        store.ensure_identity().unwrap();

        let signature = store.sign(b"hello mesh").unwrap();
        let bundle = store.public_identity_bundle().unwrap();
        assert!(bundle.verify_message(b"hello mesh", &signature).is_ok());
        assert!(bundle.verify_message(b"hello mess", &signature).is_err());
    }

    #[test]
    fn test_static_agreement_is_symmetric() {
        let (_, alice) = memory_store();
        let (_, bob) = memory_store();
        alice.ensure_identity().unwrap();
        bob.ensure_identity().unwrap();

        let alice_bundle = alice.public_identity_bundle().unwrap();
        let bob_bundle = bob.public_identity_bundle().unwrap();

        let ab = alice.agree(&bob_bundle.key_agreement_key()).unwrap();
        let ba = bob.agree(&alice_bundle.key_agreement_key()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    struct FailingStorage;

    impl SecureStorage for FailingStorage {
        fn load(&self, _name: &str) -> StorageResult<Option<Zeroizing<Vec<u8>>>> {
            Err(StorageError::Backend("keystore unavailable".to_string()))
        }

        fn save(&self, _name: &str, _bytes: &[u8]) -> StorageResult<()> {
            Err(StorageError::Backend("keystore unavailable".to_string()))
        }

        fn delete(&self, _name: &str) -> StorageResult<()> {
            Ok(())
        }
    }

    /// In-memory storage whose deletes fail while `fail_delete` is set.
    #[derive(Default)]
    struct StuckDeleteStorage {
        inner: InMemorySecureStorage,
        fail_delete: AtomicBool,
    }

    impl SecureStorage for StuckDeleteStorage {
        fn load(&self, name: &str) -> StorageResult<Option<Zeroizing<Vec<u8>>>> {
            self.inner.load(name)
        }

        fn save(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
            self.inner.save(name, bytes)
        }

        fn delete(&self, name: &str) -> StorageResult<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("delete refused".to_string()));
            }
            self.inner.delete(name)
        }
    }

    #[test]
    fn test_failed_wipe_never_reloads_old_identity() {
        let storage = Arc::new(StuckDeleteStorage::default());
        let store = IdentityKeyStore::new(storage.clone());
        let original = store.ensure_identity().unwrap();

        storage.fail_delete.store(true, Ordering::SeqCst);
        assert!(matches!(store.wipe_all(), Err(IdentityError::Storage(_))));
        assert!(!store.has_identity());
        assert_eq!(store.epoch(), 1);

        // Still stuck: refuse to come back with the old keys.
        assert!(matches!(
            store.ensure_identity(),
            Err(IdentityError::Storage(_))
        ));
        assert!(!store.has_identity());

        storage.fail_delete.store(false, Ordering::SeqCst);
        let replacement = store.ensure_identity().unwrap();
        assert_ne!(original, replacement);
        assert!(storage.inner.contains(DEFAULT_IDENTITY_RECORD));
    }

    #[test]
    fn test_storage_failure_is_reported() {
        let store = IdentityKeyStore::new(Arc::new(FailingStorage));
        assert!(matches!(
            store.ensure_identity(),
            Err(IdentityError::Storage(_))
        ));
        assert!(!store.has_identity());
    }
}
