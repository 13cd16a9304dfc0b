//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Two shapes are offered: [`EncryptedData`] keeps the Poly1305 tag appended
//! to the ciphertext and is used for small structured payloads, while
//! [`DetachedCiphertext`] keeps the tag apart so file content can be stored
//! as raw ciphertext with the nonce and tag recorded elsewhere.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Ciphertext with the authentication tag appended, plus its nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Ciphertext whose authentication tag is carried separately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedCiphertext {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

fn cipher_for(key: &DerivedKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Generates a random nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    let nonce = generate_nonce();
    let ciphertext = cipher_for(key)
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(EncryptedData { nonce, ciphertext })
}

/// Decrypts and authenticates data produced by [`encrypt`].
pub fn decrypt(key: &DerivedKey, data: &EncryptedData) -> CryptoResult<Vec<u8>> {
    cipher_for(key)
        .decrypt(Nonce::from_slice(&data.nonce), data.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decryption("wrong key or tampered data".to_string()))
}

/// Encrypts a UTF-8 string into base64(`nonce || ciphertext || tag`).
pub fn encrypt_string(key: &DerivedKey, plaintext: &str) -> CryptoResult<String> {
    let data = encrypt(key, plaintext.as_bytes())?;
    let mut packed = Vec::with_capacity(NONCE_SIZE + data.ciphertext.len());
    packed.extend_from_slice(&data.nonce);
    packed.extend_from_slice(&data.ciphertext);
    Ok(STANDARD.encode(packed))
}

/// Reverses [`encrypt_string`].
pub fn decrypt_string(key: &DerivedKey, encoded: &str) -> CryptoResult<String> {
    let packed = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::Encoding(format!("invalid base64: {e}")))?;

    if packed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Decryption(format!(
            "payload too short: {} bytes",
            packed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = packed.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);

    let plaintext = decrypt(
        key,
        &EncryptedData {
            nonce,
            ciphertext: ciphertext.to_vec(),
        },
    )?;

    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::Encoding(format!("plaintext is not UTF-8: {e}")))
}

/// Encrypts `plaintext` with an explicit nonce, returning the tag separately.
pub fn encrypt_detached(
    key: &DerivedKey,
    nonce: [u8; NONCE_SIZE],
    plaintext: Vec<u8>,
) -> CryptoResult<DetachedCiphertext> {
    let mut buffer = plaintext;
    let tag = cipher_for(key)
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(DetachedCiphertext {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypts content produced by [`encrypt_detached`].
///
/// Accepts slices so callers can feed nonce and tag straight from decoded
/// catalog fields; wrong lengths are reported rather than panicking.
pub fn decrypt_detached(
    key: &DerivedKey,
    nonce: &[u8],
    tag: &[u8],
    ciphertext: Vec<u8>,
) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: nonce.len(),
        });
    }
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::Decryption(format!(
            "invalid tag length: expected {TAG_SIZE}, got {}",
            tag.len()
        )));
    }

    let mut buffer = ciphertext;
    cipher_for(key)
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".to_string()))?;
    Ok(buffer)
}
