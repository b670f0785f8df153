//! Encrypted key/value store.
//!
//! The storage key is loaded from the keystore (or generated and persisted
//! there) the first time any operation needs it. Each operation then works
//! with an [`EncryptionContext`]: a short-lived copy of the key that is wiped
//! when the context goes out of scope, on success and on every error path.
//!
//! Operations on the same key are serialized so read-modify-write cycles
//! through [`SecureStore::update`] cannot interleave.

use crate::backend::BlobBackend;
use crate::error::{StorageError, StorageResult};
use crate::keystore::Keystore;
use bariatric_crypto::{decrypt_bound, encrypt_bound, generate_random_key, DerivedKey, EncryptedData};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Scoped access to the storage key.
///
/// Dropping the context zeroizes its copy of the key.
pub struct EncryptionContext {
    key: DerivedKey,
}

impl EncryptionContext {
    fn seal(&self, storage_key: &str, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let sealed = encrypt_bound(&self.key, plaintext, storage_key.as_bytes())
            .map_err(|e| StorageError::Corrupted(format!("failed to encrypt {storage_key}: {e}")))?;
        Ok(serde_json::to_vec(&sealed)?)
    }

    fn open(&self, storage_key: &str, blob: &[u8]) -> StorageResult<Vec<u8>> {
        let sealed: EncryptedData = serde_json::from_slice(blob)
            .map_err(|e| StorageError::Corrupted(format!("{storage_key}: {e}")))?;
        decrypt_bound(&self.key, &sealed, storage_key.as_bytes())
            .map_err(|e| StorageError::Corrupted(format!("{storage_key}: {e}")))
    }
}

/// Encrypted key/value store over a [`BlobBackend`].
pub struct SecureStore {
    backend: Arc<dyn BlobBackend>,
    keystore: Arc<dyn Keystore>,
    key: Mutex<Option<DerivedKey>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SecureStore {
    pub fn new(backend: Arc<dyn BlobBackend>, keystore: Arc<dyn Keystore>) -> Self {
        Self {
            backend,
            keystore,
            key: Mutex::new(None),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let lock = self.key_lock(key)?;
        let _guard = lock.lock().map_err(|e| StorageError::Unavailable(e.to_string()))?;
        self.put_unlocked(key, value)
    }

    /// Returns the value stored under `key`, or `None` if absent.
    pub fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let lock = self.key_lock(key)?;
        let _guard = lock.lock().map_err(|e| StorageError::Unavailable(e.to_string()))?;
        self.get_unlocked(key)
    }

    /// Removes `key`. Removing an absent key succeeds.
    pub fn delete(&self, key: &str) -> StorageResult<()> {
        let lock = self.key_lock(key)?;
        let _guard = lock.lock().map_err(|e| StorageError::Unavailable(e.to_string()))?;
        self.backend.remove(key)?;
        debug!(key, "secure store entry deleted");
        Ok(())
    }

    /// Whether a value exists for `key`, without decrypting it.
    pub fn contains(&self, key: &str) -> StorageResult<bool> {
        self.backend.exists(key)
    }

    /// Atomic read-modify-write of a single key.
    ///
    /// `f` receives the current value and returns the value to store
    /// (`None` deletes the key) together with a result for the caller. If
    /// `f` fails nothing is written.
    pub fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<Vec<u8>>) -> StorageResult<(Option<Vec<u8>>, R)>,
    ) -> StorageResult<R> {
        let lock = self.key_lock(key)?;
        let _guard = lock.lock().map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let current = self.get_unlocked(key)?;
        let (next, result) = f(current)?;
        match next {
            Some(value) => self.put_unlocked(key, &value)?,
            None => self.backend.remove(key)?,
        }
        Ok(result)
    }

    /// Serializes `value` as JSON and stores it.
    pub fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }

    /// Loads and deserializes a JSON value.
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupted(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Forgets the in-memory copy of the storage key. The next operation
    /// fetches it from the keystore again.
    pub fn release_key(&self) {
        if let Ok(mut slot) = self.key.lock() {
            *slot = None;
        }
    }

    /// Acquires the encryption context, loading or creating the storage key
    /// on first use.
    pub fn context(&self) -> StorageResult<EncryptionContext> {
        let mut slot = self
            .key
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        if let Some(key) = slot.as_ref() {
            return Ok(EncryptionContext { key: key.clone() });
        }

        let key = match self.keystore.load_key() {
            Ok(Some(key)) => key,
            Ok(None) => {
                let key = generate_random_key();
                self.keystore.store_key(&key)?;
                info!("generated new secure store key");
                key
            }
            Err(e) => {
                warn!("keystore unavailable: {e}");
                return Err(e);
            }
        };

        *slot = Some(key.clone());
        Ok(EncryptionContext { key })
    }

    fn put_unlocked(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let blob = {
            let ctx = self.context()?;
            ctx.seal(key, value)?
        };
        self.backend.write(key, &blob)
    }

    fn get_unlocked(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let Some(blob) = self.backend.read(key)? else {
            return Ok(None);
        };
        let ctx = self.context()?;
        ctx.open(key, &blob).map(Some).inspect_err(|e| {
            warn!(key, "failed to open secure store entry: {e}");
        })
    }

    fn key_lock(&self, key: &str) -> StorageResult<Arc<Mutex<()>>> {
        let mut locks = self
            .key_locks
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}
