//! Platform keystore seam.
//!
//! The keystore holds exactly one secret: the base64-encoded storage key.
//! [`KeyringKeystore`] uses the OS credential store (Keychain, Credential
//! Manager, kernel keyutils); [`MemoryKeystore`] is for tests and for
//! platforms where the host application supplies the key itself.

use crate::error::{StorageError, StorageResult};
use bariatric_crypto::DerivedKey;
use keyring::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Supplies and persists the storage encryption key.
pub trait Keystore: Send + Sync {
    /// Returns the stored key, or `None` if none has been created yet.
    fn load_key(&self) -> StorageResult<Option<DerivedKey>>;

    /// Persists a newly generated key.
    fn store_key(&self, key: &DerivedKey) -> StorageResult<()>;
}

const DEFAULT_SERVICE: &str = "bariatric-mobile";
const DEFAULT_ACCOUNT: &str = "secure-store-key";

/// Keystore backed by the OS credential store via `keyring`.
pub struct KeyringKeystore {
    service: String,
    account: String,
}

impl KeyringKeystore {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> StorageResult<Entry> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| StorageError::KeystoreUnavailable(format!("failed to open keyring entry: {e}")))
    }
}

impl Default for KeyringKeystore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE, DEFAULT_ACCOUNT)
    }
}

impl Keystore for KeyringKeystore {
    fn load_key(&self) -> StorageResult<Option<DerivedKey>> {
        match self.entry()?.get_password() {
            Ok(encoded) => DerivedKey::from_base64(&encoded)
                .map(Some)
                .map_err(|e| StorageError::KeystoreUnavailable(format!("keyring entry corrupted: {e}"))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::KeystoreUnavailable(format!(
                "failed to read storage key: {e}"
            ))),
        }
    }

    fn store_key(&self, key: &DerivedKey) -> StorageResult<()> {
        self.entry()?
            .set_password(&key.to_base64())
            .map_err(|e| StorageError::KeystoreUnavailable(format!("failed to store storage key: {e}")))
    }
}

/// In-memory keystore.
///
/// Can be locked or corrupted on demand to exercise keystore failures.
#[derive(Default)]
pub struct MemoryKeystore {
    encoded: Mutex<Option<String>>,
    locked: AtomicBool,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a locked device keystore: every call fails until unlocked.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    /// Replaces the stored key with bytes that do not decode to a key.
    pub fn corrupt(&self) {
        if let Ok(mut encoded) = self.encoded.lock() {
            *encoded = Some("%%corrupted%%".to_string());
        }
    }

    /// Whether a key has been stored.
    pub fn has_key(&self) -> bool {
        self.encoded.lock().map(|e| e.is_some()).unwrap_or(false)
    }

    fn check_unlocked(&self) -> StorageResult<()> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(StorageError::KeystoreUnavailable("keystore is locked".to_string()));
        }
        Ok(())
    }
}

impl Keystore for MemoryKeystore {
    fn load_key(&self) -> StorageResult<Option<DerivedKey>> {
        self.check_unlocked()?;
        let encoded = self
            .encoded
            .lock()
            .map_err(|e| StorageError::KeystoreUnavailable(e.to_string()))?;
        match encoded.as_deref() {
            Some(s) => DerivedKey::from_base64(s)
                .map(Some)
                .map_err(|e| StorageError::KeystoreUnavailable(format!("keystore entry corrupted: {e}"))),
            None => Ok(None),
        }
    }

    fn store_key(&self, key: &DerivedKey) -> StorageResult<()> {
        self.check_unlocked()?;
        let mut encoded = self
            .encoded
            .lock()
            .map_err(|e| StorageError::KeystoreUnavailable(e.to_string()))?;
        *encoded = Some(key.to_base64());
        Ok(())
    }
}
