//! End-to-end encrypted folders for cipherdrop.
//!
//! Uploads into an encrypted folder follow a locked protocol:
//! - Lock Manager: per-folder server locks with a process-wide token cache
//! - Metadata Synchronizer: encrypted folder catalogs with create/replace pushes
//! - Encryption Engine: per-file keys with detached authentication tags
//! - Upload Orchestrator: the job state machine, with guaranteed unlock
//!
//! The server is reached only through the traits in [`remote`];
//! [`api_client::E2eeApiClient`] implements them over HTTP.

pub mod api_client;
pub mod catalog_store;
pub mod config;
pub mod encryption;
pub mod error;
pub mod job_registry;
pub mod lock_manager;
pub mod metadata;
pub mod preview;
pub mod remote;
pub mod types;
pub mod upload;

pub use config::E2eeConfig;
pub use error::{E2eeError, E2eeResult, LockError, MetadataError, Stage, UploadError};
pub use lock_manager::{FolderLockGuard, LockCache, LockManager};
pub use metadata::MetadataSynchronizer;
pub use types::*;
pub use upload::{create_upload_orchestrator, UploadHandle, UploadOrchestrator};
