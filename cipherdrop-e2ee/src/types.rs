//! Shared types for the encrypted-folder protocol.

use crate::error::{Stage, UploadError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cipherdrop_crypto::{DerivedKey, NONCE_SIZE, TAG_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Opaque credential proving the exclusive right to mutate one folder.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short hash of the token, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockToken({})", self.fingerprint())
    }
}

/// A lock held on a folder by this account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderLock {
    pub folder_id: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
}

/// Result of releasing every cached lock for an account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: Vec<String>,
    pub failed: Vec<String>,
}

/// One encrypted file as recorded in a folder catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFileEntry {
    pub logical_file_name: String,
    /// Name of the ciphertext on the server.
    pub obfuscated_identifier: String,
    #[serde(with = "key_b64")]
    pub file_key: DerivedKey,
    pub initialization_vector: [u8; NONCE_SIZE],
    pub authentication_tag: [u8; TAG_SIZE],
    pub mime_type: String,
    /// Local copy of the ciphertext, when this device still has one.
    pub local_ciphertext_path: Option<PathBuf>,
}

/// Decrypted catalog of one encrypted folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderMetadataCatalog {
    pub folder_id: String,
    pub metadata_key: DerivedKey,
    pub metadata_key_index: u32,
    pub entries: Vec<EncryptedFileEntry>,
}

impl FolderMetadataCatalog {
    /// Finds the entry for a logical file name.
    pub fn entry(&self, logical_file_name: &str) -> Option<&EncryptedFileEntry> {
        self.entries
            .iter()
            .find(|e| e.logical_file_name == logical_file_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How a catalog is written back to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogWriteMode {
    Create,
    Replace,
}

impl CatalogWriteMode {
    /// `Create` when no catalog existed at fetch time, otherwise `Replace`.
    pub fn for_existing(catalog_exists: bool) -> Self {
        if catalog_exists {
            CatalogWriteMode::Replace
        } else {
            CatalogWriteMode::Create
        }
    }
}

/// Server capabilities relevant to encrypted folders.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub e2ee_enabled: bool,
    pub e2ee_api_version: Option<String>,
}

impl ServerCapabilities {
    /// Checks that this client can write the server's protocol version.
    pub fn check_writable(&self, supported: &[String]) -> Result<(), String> {
        if !self.e2ee_enabled {
            return Err("end-to-end encryption is disabled on the server".to_string());
        }
        match &self.e2ee_api_version {
            Some(version) if supported.iter().any(|v| v == version) => Ok(()),
            Some(version) => Err(format!(
                "server speaks {version}, client supports {}",
                supported.join(", ")
            )),
            None => Err("server did not advertise an encryption API version".to_string()),
        }
    }
}

/// Byte progress of a ciphertext transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_sent as f64 / self.total_bytes as f64
    }
}

/// Callback invoked as ciphertext bytes are handed to the network.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// A ciphertext upload addressed to a locked folder.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub folder_id: String,
    /// Server path of the encrypted folder, relative to the user's root.
    pub folder_path: String,
    pub destination_name: String,
    pub token: LockToken,
    pub ciphertext: Bytes,
}

/// What the server reports after storing a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReceipt {
    pub remote_id: String,
    pub etag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A caller's request for an encrypted upload.
#[derive(Clone)]
pub struct UploadRequest {
    pub folder_id: String,
    pub folder_path: String,
    pub plaintext_path: PathBuf,
    pub logical_name: String,
    /// Overrides the mime type guessed from the file name.
    pub mime_type: Option<String>,
    pub progress: Option<ProgressCallback>,
}

impl UploadRequest {
    pub fn new(
        folder_id: impl Into<String>,
        folder_path: impl Into<String>,
        plaintext_path: impl Into<PathBuf>,
        logical_name: impl Into<String>,
    ) -> Self {
        Self {
            folder_id: folder_id.into(),
            folder_path: folder_path.into(),
            plaintext_path: plaintext_path.into(),
            logical_name: logical_name.into(),
            mime_type: None,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("folder_id", &self.folder_id)
            .field("folder_path", &self.folder_path)
            .field("plaintext_path", &self.plaintext_path)
            .field("logical_name", &self.logical_name)
            .field("mime_type", &self.mime_type)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Lifecycle state of an upload job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Validating,
    Locking,
    MetadataSync,
    Transferring,
    Committing,
    Unlocking,
    Done,
    Failed(Stage),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Validating => f.write_str("validating"),
            JobState::Locking => f.write_str("locking"),
            JobState::MetadataSync => f.write_str("metadata-sync"),
            JobState::Transferring => f.write_str("transferring"),
            JobState::Committing => f.write_str("committing"),
            JobState::Unlocking => f.write_str("unlocking"),
            JobState::Done => f.write_str("done"),
            JobState::Failed(stage) => write!(f, "failed({stage})"),
            JobState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Ephemeral record of an in-flight upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadJob {
    pub temporary_id: String,
    pub folder_id: String,
    pub plaintext_path: PathBuf,
    pub target_logical_name: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
}

impl UploadJob {
    /// Creates a job with a fresh time-ordered temporary id.
    pub fn from_request(request: &UploadRequest) -> Self {
        Self {
            temporary_id: format!("tmp-{}", uuid::Uuid::now_v7()),
            folder_id: request.folder_id.clone(),
            plaintext_path: request.plaintext_path.clone(),
            target_logical_name: request.logical_name.clone(),
            state: JobState::Validating,
            created_at: Utc::now(),
        }
    }
}

/// A successfully finished upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedUpload {
    pub temporary_id: String,
    pub final_id: String,
    pub folder_id: String,
    pub logical_file_name: String,
    pub obfuscated_identifier: String,
    pub etag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal result of an upload job.
pub type UploadOutcome = Result<CompletedUpload, UploadError>;

/// The one notification emitted when a job reaches a terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadNotification {
    pub folder_id: String,
    pub logical_file_name: String,
    pub temporary_id: String,
    pub final_id: Option<String>,
    pub error: Option<UploadError>,
}

impl UploadNotification {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Guesses a mime type from a file name's extension.
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// Serde adapter storing a key as base64.
mod key_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use cipherdrop_crypto::DerivedKey;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &DerivedKey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DerivedKey, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        DerivedKey::from_slice(&bytes).map_err(de::Error::custom)
    }
}
