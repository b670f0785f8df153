//! Encrypted local persistence for the bariatric sync core.
//!
//! # Architecture
//!
//! - [`Keystore`] is the platform keystore seam. It holds the single storage
//!   key, generated on first use and never handed to callers.
//! - [`BlobBackend`] is where ciphertext lives: a directory of files on
//!   device, or a map in memory for tests.
//! - [`SecureStore`] joins the two behind `put`/`get`/`delete`. Every value is
//!   sealed with ChaCha20-Poly1305 and bound to its key.
//! - [`RecordCache`] keeps cached entity records and their sync cursor inside
//!   the secure store, one blob per entity type, so a cursor and the records it
//!   describes are always written together.

mod backend;
mod error;
mod keystore;
mod record_cache;
mod secure_store;

pub use backend::{BlobBackend, FileBackend, MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use keystore::{KeyringKeystore, Keystore, MemoryKeystore};
pub use record_cache::{ApplyOutcome, CachedRecord, Conflict, EntityState, RecordCache, RemoteRecord, SyncCursor};
pub use secure_store::{EncryptionContext, SecureStore};
