//! Secure-storage capability for long-term key material.
//!
//! Each target platform supplies its own backend (Android Keystore-wrapped
//! preferences, iOS Keychain, a desktop secret service). The key store only
//! needs opaque load/save/delete keyed by a record name, where delete must be
//! irreversible.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::{StorageError, StorageResult};

/// Opaque blob persistence keyed by record name.
pub trait SecureStorage: Send + Sync {
    /// Load a record, `None` if absent.
    fn load(&self, name: &str) -> StorageResult<Option<Zeroizing<Vec<u8>>>>;

    /// Create or replace a record.
    fn save(&self, name: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Irreversibly destroy a record. Deleting an absent record succeeds.
    fn delete(&self, name: &str) -> StorageResult<()>;
}

/// Process-local storage for tests and ephemeral devices.
#[derive(Default)]
pub struct InMemorySecureStorage {
    records: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl InMemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, Zeroizing<Vec<u8>>>>> {
        self.records
            .lock()
            .map_err(|e| StorageError::Backend(format!("Lock error: {}", e)))
    }

    /// Whether a record with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.records().map(|r| r.contains_key(name)).unwrap_or(false)
    }
}

impl SecureStorage for InMemorySecureStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Zeroizing<Vec<u8>>>> {
        Ok(self.records()?.get(name).cloned())
    }

    fn save(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        self.records()?
            .insert(name.to_string(), Zeroizing::new(bytes.to_vec()));
        Ok(())
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        // Zeroizing clears the buffer as the removed entry drops.
        self.records()?.remove(name);
        Ok(())
    }
}

/// File-per-record storage for desktop hosts and development nodes.
///
/// Records are written with owner-only permissions on Unix and overwritten
/// with zeros before unlinking on delete. This is only as strong as the
/// host's disk encryption; mobile platforms should use their keystore.
#[derive(Debug, Clone)]
pub struct FileSecureStorage {
    dir: PathBuf,
}

impl FileSecureStorage {
    /// Use `dir` for records, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> StorageResult<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !name.starts_with('.');
        if !valid {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

impl SecureStorage for FileSecureStorage {
    fn load(&self, name: &str) -> StorageResult<Option<Zeroizing<Vec<u8>>>> {
        let path = self.record_path(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.record_path(name)?;
        let tmp = self.dir.join(format!("{}.tmp", name));

        {
            let mut options = fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.record_path(name)?;
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        {
            let mut file = fs::OpenOptions::new().write(true).open(&path)?;
            file.write_all(&vec![0u8; len])?;
            file.sync_all()?;
        }

        fs::remove_file(&path)?;
        tracing::debug!(record = name, "secure storage record destroyed");
        Ok(())
    }
}
