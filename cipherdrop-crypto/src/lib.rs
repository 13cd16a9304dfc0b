//! Encryption layer for cipherdrop.
//!
//! Provides the primitives behind end-to-end encrypted folders:
//! - ChaCha20-Poly1305 for authenticated encryption
//! - X25519 envelopes for sealing folder metadata keys to an account
//! - Secure key management with zeroization
//!
//! # Architecture
//!
//! Encrypted folders use a two-tier key system:
//!
//! 1. **Metadata Key**: A random key generated once per folder, when the
//!    folder's first catalog is written. It encrypts the catalog (file names,
//!    mime types and per-file keys) and is itself sealed to the account's
//!    public key before it leaves the device.
//!
//! 2. **File Key**: A random key and nonce generated for every uploaded file.
//!    It encrypts the file content with a detached authentication tag. File
//!    keys live only inside the encrypted catalog.
//!
//! Compromising one file key reveals nothing about other files, and the
//! server never sees either tier in the clear.

mod cipher;
pub mod envelope;
mod error;
mod key;

pub use cipher::{
    decrypt, decrypt_detached, decrypt_string, encrypt, encrypt_detached, encrypt_string,
    generate_nonce, DetachedCiphertext, EncryptedData, NONCE_SIZE, TAG_SIZE,
};
pub use envelope::{generate_account_keypair, open_key, seal_key, AccountKeyPair, SealedEnvelope};
pub use error::{CryptoError, CryptoResult};
pub use key::{generate_random_key, DerivedKey, KEY_SIZE};
