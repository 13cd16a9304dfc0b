//! Error types for the encrypted-folder protocol.
//!
//! [`E2eeError`] covers transport and local I/O failures. The component
//! errors ([`LockError`], [`MetadataError`]) are what the Lock Manager and
//! Metadata Synchronizer hand back, and [`UploadError`] is the terminal
//! taxonomy every upload job resolves to.

use std::fmt;
use thiserror::Error;

/// Result type for protocol operations.
pub type E2eeResult<T> = Result<T, E2eeError>;

/// Errors raised by the remote API client and local collaborators.
#[derive(Debug, Error)]
pub enum E2eeError {
    #[error("API request failed: {0}")]
    Api(String),

    #[error("folder lock contention: {0}")]
    LockContention(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] cipherdrop_crypto::CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid file id: {0:?}")]
    InvalidId(String),
}

/// Failures reported by the Lock Manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock unavailable for folder {folder_id}: {reason}")]
    Unavailable { folder_id: String, reason: String },

    #[error("unlock failed for folder {folder_id}: {reason}")]
    ReleaseFailed { folder_id: String, reason: String },
}

/// Failures reported by the Metadata Synchronizer.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata for folder {folder_id} is corrupt: {reason}")]
    Corrupt { folder_id: String, reason: String },

    #[error("metadata fetch failed for folder {folder_id}: {reason}")]
    FetchFailed { folder_id: String, reason: String },

    #[error("metadata push rejected for folder {folder_id}: {reason}")]
    PushRejected { folder_id: String, reason: String },

    #[error("metadata encoding failed for folder {folder_id}: {reason}")]
    Encoding { folder_id: String, reason: String },
}

/// Stages of an upload job, used to locate a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Validating,
    Locking,
    MetadataSync,
    Transferring,
    Committing,
    Unlocking,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validating => "validating",
            Stage::Locking => "locking",
            Stage::MetadataSync => "metadata-sync",
            Stage::Transferring => "transferring",
            Stage::Committing => "committing",
            Stage::Unlocking => "unlocking",
        };
        f.write_str(name)
    }
}

/// Terminal error of an upload job.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("encryption protocol version not writable: {0}")]
    VersionNotWritable(String),

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("source file unreadable: {0}")]
    SourceUnreadable(String),

    #[error("folder lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("folder metadata corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("folder metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("folder metadata push rejected: {0}")]
    MetadataPushRejected(String),

    #[error("file encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("transfer cancelled")]
    TransferCancelled,

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("upload task interrupted: {0}")]
    Interrupted(String),
}

impl UploadError {
    /// The stage the job was in when it failed.
    ///
    /// `None` only for [`UploadError::Interrupted`], where the task died
    /// without reporting a stage.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            UploadError::VersionNotWritable(_)
            | UploadError::SizeExceeded { .. }
            | UploadError::SourceUnreadable(_) => Some(Stage::Validating),
            UploadError::LockUnavailable(_) => Some(Stage::Locking),
            UploadError::MetadataCorrupt(_)
            | UploadError::MetadataUnavailable(_)
            | UploadError::MetadataPushRejected(_)
            | UploadError::EncryptionFailed(_) => Some(Stage::MetadataSync),
            UploadError::TransferCancelled | UploadError::TransferFailed(_) => {
                Some(Stage::Transferring)
            }
            UploadError::Interrupted(_) => None,
        }
    }

    /// Whether the error should be surfaced to the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, UploadError::TransferCancelled)
    }
}

impl From<LockError> for UploadError {
    fn from(err: LockError) -> Self {
        UploadError::LockUnavailable(err.to_string())
    }
}

impl From<MetadataError> for UploadError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Corrupt { .. } => UploadError::MetadataCorrupt(err.to_string()),
            MetadataError::FetchFailed { .. } => UploadError::MetadataUnavailable(err.to_string()),
            MetadataError::PushRejected { .. } => {
                UploadError::MetadataPushRejected(err.to_string())
            }
            MetadataError::Encoding { .. } => UploadError::EncryptionFailed(err.to_string()),
        }
    }
}
