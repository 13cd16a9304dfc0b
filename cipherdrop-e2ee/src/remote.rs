//! Seams to the remote coordinator.
//!
//! The Lock Manager, Metadata Synchronizer and Upload Orchestrator talk to
//! the server only through these traits. [`crate::api_client::E2eeApiClient`]
//! implements all three over HTTP.

use crate::error::E2eeResult;
use crate::types::{
    CatalogWriteMode, LockToken, ProgressCallback, TransferReceipt, TransferRequest,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Remote folder lock coordinator.
#[async_trait]
pub trait LockApi: Send + Sync {
    /// Locks a folder. A previously held token is presented so the server
    /// can confirm ownership or hand out a replacement.
    async fn lock_folder(
        &self,
        folder_id: &str,
        existing: Option<&LockToken>,
    ) -> E2eeResult<LockToken>;

    /// Unlocks a folder. Returns `E2eeError::NotFound` when the server holds
    /// no lock for this token.
    async fn unlock_folder(&self, folder_id: &str, token: &LockToken) -> E2eeResult<()>;
}

/// Remote store of encrypted folder catalogs.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Returns the raw catalog blob, or `None` when the folder has none yet.
    async fn get_metadata(&self, folder_id: &str, token: &LockToken)
        -> E2eeResult<Option<String>>;

    async fn put_metadata(
        &self,
        folder_id: &str,
        token: &LockToken,
        blob: &str,
        mode: CatalogWriteMode,
    ) -> E2eeResult<()>;
}

/// Remote sink for ciphertext.
#[async_trait]
pub trait TransferApi: Send + Sync {
    /// Uploads ciphertext. Resolves to `E2eeError::Cancelled` once `cancel`
    /// fires, abandoning the in-flight request.
    async fn upload(
        &self,
        request: TransferRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> E2eeResult<TransferReceipt>;
}
