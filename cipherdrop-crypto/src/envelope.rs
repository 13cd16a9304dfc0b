//! Sealing folder metadata keys to an account.
//!
//! A metadata key only leaves the device inside a [`SealedEnvelope`]: a
//! one-time X25519 key agrees a secret with the account's public key and
//! XSalsa20-Poly1305 seals the metadata key under it. Opening requires the
//! account's secret key, so the server stores envelopes it cannot read.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use base64::{engine::general_purpose::STANDARD, Engine};
use crypto_box::aead::Aead;
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Nonce size of XSalsa20.
const ENVELOPE_NONCE_SIZE: usize = 24;

/// The X25519 key pair that owns an account's folder catalogs.
pub struct AccountKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl AccountKeyPair {
    /// Restores a key pair from its secret half.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = SecretKey::from(bytes);
        Self {
            public: secret.public_key(),
            secret,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }
}

impl std::fmt::Debug for AccountKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKeyPair")
            .field("public", &STANDARD.encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// A metadata key sealed to one account, as stored in a folder catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub ephemeral_public_key: [u8; 32],
    pub nonce: [u8; ENVELOPE_NONCE_SIZE],
    /// The metadata key followed by the Poly1305 tag.
    pub sealed_key: Vec<u8>,
}

/// Generates a fresh account key pair.
pub fn generate_account_keypair() -> AccountKeyPair {
    AccountKeyPair::from_secret_bytes(SecretKey::generate(&mut OsRng).to_bytes())
}

/// Seals a metadata key so only the holder of `recipient`'s secret opens it.
pub fn seal_key(key: &DerivedKey, recipient: &PublicKey) -> CryptoResult<SealedEnvelope> {
    let ephemeral = SecretKey::generate(&mut OsRng);
    let mut nonce = [0u8; ENVELOPE_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let sealed_key = SalsaBox::new(recipient, &ephemeral)
        .encrypt(Nonce::from_slice(&nonce), key.as_bytes().as_slice())
        .map_err(|_| CryptoError::Encryption("cannot seal metadata key".to_string()))?;

    Ok(SealedEnvelope {
        ephemeral_public_key: *ephemeral.public_key().as_bytes(),
        nonce,
        sealed_key,
    })
}

/// Opens a sealed metadata key with the account's secret key.
pub fn open_key(envelope: &SealedEnvelope, account: &AccountKeyPair) -> CryptoResult<DerivedKey> {
    let sender = PublicKey::from(envelope.ephemeral_public_key);
    let raw = SalsaBox::new(&sender, &account.secret)
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            envelope.sealed_key.as_slice(),
        )
        .map(Zeroizing::new)
        .map_err(|_| {
            CryptoError::Decryption(
                "metadata key envelope does not open for this account".to_string(),
            )
        })?;
    DerivedKey::from_slice(&raw)
}
