//! File encryption for encrypted folders.
//!
//! Every file gets its own random key and nonce. The ciphertext is staged in
//! the work directory under an obfuscated identifier, which is also the
//! name it is stored under on the server.

use crate::error::{E2eeError, E2eeResult};
use crate::types::guess_mime_type;
use cipherdrop_crypto::{
    decrypt_detached, encrypt_detached, generate_nonce, generate_random_key, DerivedKey,
    NONCE_SIZE, TAG_SIZE,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A file encrypted and staged for transfer.
#[derive(Clone, Debug)]
pub struct EncryptedFile {
    pub ciphertext_path: PathBuf,
    pub obfuscated_identifier: String,
    pub file_key: DerivedKey,
    pub initialization_vector: [u8; NONCE_SIZE],
    pub authentication_tag: [u8; TAG_SIZE],
    pub ciphertext_size: u64,
    pub mime_type: String,
}

/// Encrypts and decrypts file content.
#[derive(Clone, Debug)]
pub struct EncryptionEngine {
    work_dir: PathBuf,
}

impl EncryptionEngine {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Generates a folder's metadata key.
    pub fn generate_folder_key() -> DerivedKey {
        generate_random_key()
    }

    /// Encrypts a plaintext file under a fresh per-file key.
    pub async fn encrypt_file(
        &self,
        plaintext_path: &Path,
        logical_name: &str,
    ) -> E2eeResult<EncryptedFile> {
        let plaintext = tokio::fs::read(plaintext_path).await?;
        let identifier = uuid::Uuid::new_v4().simple().to_string();
        let file_key = generate_random_key();
        let nonce = generate_nonce();

        let key = file_key.clone();
        let sealed = tokio::task::spawn_blocking(move || encrypt_detached(&key, nonce, plaintext))
            .await
            .map_err(|e| E2eeError::Api(format!("encryption task failed: {e}")))??;

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let ciphertext_path = self.work_dir.join(&identifier);
        tokio::fs::write(&ciphertext_path, &sealed.ciphertext).await?;

        debug!(
            "encrypted {logical_name} as {identifier} ({} bytes)",
            sealed.ciphertext.len()
        );
        Ok(EncryptedFile {
            ciphertext_path,
            obfuscated_identifier: identifier,
            file_key,
            initialization_vector: sealed.nonce,
            authentication_tag: sealed.tag,
            ciphertext_size: sealed.ciphertext.len() as u64,
            mime_type: guess_mime_type(logical_name).to_string(),
        })
    }

    /// Decrypts a staged or downloaded ciphertext file.
    pub async fn decrypt_file(
        &self,
        ciphertext_path: &Path,
        file_key: &DerivedKey,
        initialization_vector: &[u8],
        authentication_tag: &[u8],
    ) -> E2eeResult<Vec<u8>> {
        let ciphertext = tokio::fs::read(ciphertext_path).await?;
        let key = file_key.clone();
        let iv = initialization_vector.to_vec();
        let tag = authentication_tag.to_vec();
        let plaintext =
            tokio::task::spawn_blocking(move || decrypt_detached(&key, &iv, &tag, ciphertext))
                .await
                .map_err(|e| E2eeError::Api(format!("decryption task failed: {e}")))??;
        Ok(plaintext)
    }

    /// Removes a staged ciphertext. A missing file is not an error.
    pub async fn discard(&self, ciphertext_path: &Path) -> E2eeResult<()> {
        match tokio::fs::remove_file(ciphertext_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
