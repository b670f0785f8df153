//! Encryption layer for the bariatric sync core.
//!
//! Provides the primitives the secure store is built on:
//! - ChaCha20-Poly1305 authenticated encryption, optionally bound to
//!   associated data (the storage key a value belongs to)
//! - 256-bit symmetric keys that are zeroized when dropped
//! - Base64 transport encoding for persisting key material in a keystore
//!
//! Keys are generated once from the OS random source and handed to the
//! platform keystore; nothing in this crate persists anything.

mod cipher;
mod error;
mod key;

pub use cipher::{decrypt, decrypt_bound, encrypt, encrypt_bound, EncryptedData, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{generate_random_key, DerivedKey, KEY_SIZE};
