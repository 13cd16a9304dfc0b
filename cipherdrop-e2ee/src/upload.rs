//! Encrypted upload orchestrator.
//!
//! Drives each upload job through its stages:
//!
//! ```text
//! Validating → Locking → MetadataSync → Transferring → Committing → Unlocking → Done
//! ```
//!
//! Any stage may end the job in `Failed(stage)`, and a cancelled transfer
//! ends it in `Cancelled`. Once Locking succeeds the folder lock is owned by
//! a [`FolderLockGuard`] and released exactly once, whatever happens after.
//! Every job emits exactly one [`UploadNotification`].
//!
//! Jobs on different folders run concurrently. A job for a folder that is
//! already locked, by this process or another client, fails at Locking.

use crate::config::E2eeConfig;
use crate::encryption::{EncryptedFile, EncryptionEngine};
use crate::error::{E2eeError, Stage, UploadError};
use crate::job_registry::JobRegistry;
use crate::lock_manager::{FolderLockGuard, LockManager};
use crate::metadata::MetadataSynchronizer;
use crate::preview::PreviewCache;
use crate::remote::TransferApi;
use crate::types::*;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Handle to a submitted upload job.
pub struct UploadHandle {
    temporary_id: String,
    folder_id: String,
    logical_file_name: String,
    cancel: CancellationToken,
    task: JoinHandle<UploadOutcome>,
    notify_tx: mpsc::Sender<UploadNotification>,
}

impl UploadHandle {
    /// Temporary id of the job.
    pub fn job_id(&self) -> &str {
        &self.temporary_id
    }

    /// Requests cancellation. Only a job that has not finished its transfer
    /// is affected.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the job's terminal result.
    ///
    /// If the job task panicked, the notification it never sent is sent
    /// here and the job resolves to [`UploadError::Interrupted`].
    pub async fn join(self) -> UploadOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = UploadError::Interrupted(e.to_string());
                warn!("upload {} interrupted: {e}", self.temporary_id);
                let notification = UploadNotification {
                    folder_id: self.folder_id,
                    logical_file_name: self.logical_file_name,
                    temporary_id: self.temporary_id,
                    final_id: None,
                    error: Some(error.clone()),
                };
                if self.notify_tx.send(notification).await.is_err() {
                    debug!("no listener for upload notifications");
                }
                Err(error)
            }
        }
    }
}

/// Runs encrypted upload jobs.
#[derive(Clone)]
pub struct UploadOrchestrator {
    config: Arc<E2eeConfig>,
    capabilities: Arc<RwLock<Option<ServerCapabilities>>>,
    locks: Arc<LockManager>,
    metadata: Arc<MetadataSynchronizer>,
    engine: EncryptionEngine,
    transfer: Arc<dyn TransferApi>,
    jobs: Arc<dyn JobRegistry>,
    previews: PreviewCache,
    notify_tx: mpsc::Sender<UploadNotification>,
}

/// Creates an orchestrator and the receiver of its terminal notifications.
pub fn create_upload_orchestrator(
    config: E2eeConfig,
    locks: Arc<LockManager>,
    metadata: Arc<MetadataSynchronizer>,
    transfer: Arc<dyn TransferApi>,
    jobs: Arc<dyn JobRegistry>,
) -> (UploadOrchestrator, mpsc::Receiver<UploadNotification>) {
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

    let orchestrator = UploadOrchestrator {
        engine: EncryptionEngine::new(config.work_dir.clone()),
        previews: PreviewCache::new(config.preview_dir.clone()),
        config: Arc::new(config),
        capabilities: Arc::new(RwLock::new(None)),
        locks,
        metadata,
        transfer,
        jobs,
        notify_tx,
    };

    (orchestrator, notify_rx)
}

impl UploadOrchestrator {
    /// Installs the server capabilities checked during validation.
    pub async fn set_capabilities(&self, capabilities: ServerCapabilities) {
        *self.capabilities.write().await = Some(capabilities);
    }

    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.read().await.clone()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn previews(&self) -> &PreviewCache {
        &self.previews
    }

    pub fn engine(&self) -> &EncryptionEngine {
        &self.engine
    }

    /// Spawns an upload job.
    pub fn submit(&self, request: UploadRequest) -> UploadHandle {
        let job = UploadJob::from_request(&request);
        let cancel = CancellationToken::new();

        let handle_parts = (
            job.temporary_id.clone(),
            job.folder_id.clone(),
            job.target_logical_name.clone(),
        );

        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { this.run_job(job, request, token).await });

        UploadHandle {
            temporary_id: handle_parts.0,
            folder_id: handle_parts.1,
            logical_file_name: handle_parts.2,
            cancel,
            task,
            notify_tx: self.notify_tx.clone(),
        }
    }

    /// Runs an upload job on the current task.
    pub async fn run(&self, request: UploadRequest, cancel: CancellationToken) -> UploadOutcome {
        let job = UploadJob::from_request(&request);
        self.run_job(job, request, cancel).await
    }

    async fn run_job(
        &self,
        job: UploadJob,
        request: UploadRequest,
        cancel: CancellationToken,
    ) -> UploadOutcome {
        if let Err(e) = self.jobs.create(&job).await {
            warn!("cannot record upload {}: {e}", job.temporary_id);
        }
        info!(
            "upload {} started: {} into folder {}",
            job.temporary_id, request.logical_name, request.folder_id
        );

        let outcome = self.drive(&job, &request, &cancel).await;
        self.finish(&job, outcome).await
    }

    async fn drive(
        &self,
        job: &UploadJob,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        let temp = job.temporary_id.as_str();

        debug!("upload {temp}: {}", JobState::Validating);
        self.validate(request).await?;

        self.enter(temp, JobState::Locking).await;
        let guard = self.locks.acquire_scoped(&request.folder_id).await?;

        let outcome = self.locked_stages(temp, request, cancel, &guard).await;

        self.enter(temp, JobState::Unlocking).await;
        if let Err(e) = guard.release().await {
            warn!("upload {temp}: {e}; token kept for the next sweep");
        }

        outcome
    }

    async fn validate(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let capabilities = self.capabilities.read().await.clone().ok_or_else(|| {
            UploadError::VersionNotWritable("server capabilities unknown".to_string())
        })?;
        capabilities
            .check_writable(&self.config.supported_e2ee_versions)
            .map_err(UploadError::VersionNotWritable)?;

        let metadata = tokio::fs::metadata(&request.plaintext_path)
            .await
            .map_err(|e| {
                UploadError::SourceUnreadable(format!(
                    "{}: {e}",
                    request.plaintext_path.display()
                ))
            })?;
        if !metadata.is_file() {
            return Err(UploadError::SourceUnreadable(format!(
                "{} is not a regular file",
                request.plaintext_path.display()
            )));
        }

        let limit = self.config.max_ciphertext_size_bytes;
        if metadata.len() > limit {
            return Err(UploadError::SizeExceeded {
                size: metadata.len(),
                limit,
            });
        }
        Ok(())
    }

    async fn locked_stages(
        &self,
        temp: &str,
        request: &UploadRequest,
        cancel: &CancellationToken,
        guard: &FolderLockGuard,
    ) -> UploadOutcome {
        let folder_id = request.folder_id.as_str();
        let token = guard.token();

        self.enter(temp, JobState::MetadataSync).await;
        let existing = self.metadata.fetch_catalog(folder_id, token).await?;
        let mode = CatalogWriteMode::for_existing(existing.is_some());

        let encrypted = self
            .engine
            .encrypt_file(&request.plaintext_path, &request.logical_name)
            .await
            .map_err(|e| UploadError::EncryptionFailed(e.to_string()))?;

        let entry = EncryptedFileEntry {
            logical_file_name: request.logical_name.clone(),
            obfuscated_identifier: encrypted.obfuscated_identifier.clone(),
            file_key: encrypted.file_key.clone(),
            initialization_vector: encrypted.initialization_vector,
            authentication_tag: encrypted.authentication_tag,
            mime_type: request
                .mime_type
                .clone()
                .unwrap_or_else(|| encrypted.mime_type.clone()),
            local_ciphertext_path: Some(encrypted.ciphertext_path.clone()),
        };
        let superseded: Vec<PathBuf> = existing
            .iter()
            .flat_map(|c| c.entries.iter())
            .filter(|e| e.logical_file_name == request.logical_name)
            .filter_map(|e| e.local_ciphertext_path.clone())
            .collect();
        let catalog = self.metadata.merge_entry(folder_id, existing, entry);

        if let Err(e) = self
            .metadata
            .push_catalog(folder_id, token, &catalog, mode)
            .await
        {
            self.discard(&encrypted.ciphertext_path).await;
            return Err(e.into());
        }
        for path in superseded
            .iter()
            .filter(|p| p.starts_with(self.engine.work_dir()))
        {
            debug!("upload {temp}: dropping superseded ciphertext {}", path.display());
            self.discard(path).await;
        }

        self.enter(temp, JobState::Transferring).await;
        let receipt = match self
            .transfer_ciphertext(request, &encrypted, token, cancel)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.discard(&encrypted.ciphertext_path).await;
                return Err(e);
            }
        };

        self.enter(temp, JobState::Committing).await;
        let completed = CompletedUpload {
            temporary_id: temp.to_string(),
            final_id: receipt.remote_id,
            folder_id: folder_id.to_string(),
            logical_file_name: request.logical_name.clone(),
            obfuscated_identifier: encrypted.obfuscated_identifier,
            etag: receipt.etag,
            timestamp: receipt.timestamp,
        };

        if let Err(e) = self.jobs.commit(temp, &completed).await {
            warn!("upload {temp}: cannot commit job record: {e}");
        }
        match self.previews.relocate(temp, &completed.final_id).await {
            Ok(true) => debug!("upload {temp}: preview moved to {}", completed.final_id),
            Ok(false) => {}
            Err(e) => warn!("upload {temp}: cannot move preview: {e}"),
        }

        Ok(completed)
    }

    async fn transfer_ciphertext(
        &self,
        request: &UploadRequest,
        encrypted: &EncryptedFile,
        token: &LockToken,
        cancel: &CancellationToken,
    ) -> Result<TransferReceipt, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::TransferCancelled);
        }

        let ciphertext = tokio::fs::read(&encrypted.ciphertext_path)
            .await
            .map_err(|e| UploadError::TransferFailed(format!("staged ciphertext unreadable: {e}")))?;

        let transfer = TransferRequest {
            folder_id: request.folder_id.clone(),
            folder_path: request.folder_path.clone(),
            destination_name: encrypted.obfuscated_identifier.clone(),
            token: token.clone(),
            ciphertext: Bytes::from(ciphertext),
        };

        match self
            .transfer
            .upload(transfer, request.progress.clone(), cancel.clone())
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(E2eeError::Cancelled) => Err(UploadError::TransferCancelled),
            Err(_) if cancel.is_cancelled() => Err(UploadError::TransferCancelled),
            Err(e) => Err(UploadError::TransferFailed(e.to_string())),
        }
    }

    /// Records the terminal state, cleans up and notifies.
    async fn finish(&self, job: &UploadJob, outcome: UploadOutcome) -> UploadOutcome {
        let temp = job.temporary_id.as_str();

        let (record_id, terminal) = match &outcome {
            Ok(completed) => (completed.final_id.as_str(), JobState::Done),
            Err(UploadError::TransferCancelled) => (temp, JobState::Cancelled),
            Err(e) => (temp, JobState::Failed(e.stage().unwrap_or(Stage::Validating))),
        };
        if let Err(e) = self.jobs.update_state(record_id, terminal).await {
            warn!("upload {temp}: cannot record {terminal}: {e}");
        }

        match &outcome {
            Ok(completed) => info!("upload {temp} done as {}", completed.final_id),
            Err(error) => {
                if error.is_user_visible() {
                    warn!("upload {temp} {terminal}: {error}");
                } else {
                    info!("upload {temp} cancelled");
                }
                if let Err(e) = self.jobs.remove(temp).await {
                    warn!("upload {temp}: cannot remove job record: {e}");
                }
                if matches!(error, UploadError::TransferCancelled) {
                    if let Err(e) = self.previews.purge(temp).await {
                        warn!("upload {temp}: cannot purge preview: {e}");
                    }
                }
            }
        }

        let notification = UploadNotification {
            folder_id: job.folder_id.clone(),
            logical_file_name: job.target_logical_name.clone(),
            temporary_id: job.temporary_id.clone(),
            final_id: outcome.as_ref().ok().map(|c| c.final_id.clone()),
            error: outcome.as_ref().err().cloned(),
        };
        if self.notify_tx.send(notification).await.is_err() {
            debug!("no listener for upload notifications");
        }

        outcome
    }

    async fn enter(&self, temp: &str, state: JobState) {
        debug!("upload {temp}: {state}");
        if let Err(e) = self.jobs.update_state(temp, state).await {
            warn!("upload {temp}: cannot record {state}: {e}");
        }
    }

    async fn discard(&self, ciphertext_path: &Path) {
        if let Err(e) = self.engine.discard(ciphertext_path).await {
            warn!(
                "cannot remove staged ciphertext {}: {e}",
                ciphertext_path.display()
            );
        }
    }
}
