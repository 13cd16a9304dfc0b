//! Shared test helpers: an in-process remote and a wired-up orchestrator.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use cipherdrop_crypto::{generate_account_keypair, AccountKeyPair};
use cipherdrop_e2ee::catalog_store::MemoryCatalogStore;
use cipherdrop_e2ee::job_registry::MemoryJobRegistry;
use cipherdrop_e2ee::remote::{LockApi, MetadataApi, TransferApi};
use cipherdrop_e2ee::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub const ACCOUNT: &str = "alice";

/// Routes `tracing` output to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A call made against the remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Lock {
        folder_id: String,
        presented: Option<String>,
    },
    Unlock {
        folder_id: String,
        token: String,
    },
    GetMetadata {
        folder_id: String,
    },
    PutMetadata {
        folder_id: String,
        mode: CatalogWriteMode,
    },
    Upload {
        folder_id: String,
        destination_name: String,
        size: usize,
    },
}

impl Call {
    pub fn is_metadata(&self) -> bool {
        matches!(self, Call::GetMetadata { .. } | Call::PutMetadata { .. })
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, Call::Upload { .. })
    }

    pub fn is_unlock(&self) -> bool {
        matches!(self, Call::Unlock { .. })
    }
}

/// How the remote answers ciphertext uploads.
#[derive(Clone, Debug)]
pub enum TransferBehavior {
    Succeed,
    Fail(String),
    /// Reports partial progress, then blocks until cancelled.
    WaitForCancel,
}

/// In-process stand-in for the server's lock, metadata and WebDAV endpoints.
///
/// Holds real server-side state: a lock table, catalog blobs per folder and
/// uploaded ciphertext by name. Catalog writes require the folder's current
/// lock token.
pub struct MockRemote {
    calls: Mutex<Vec<Call>>,
    locks: Mutex<HashMap<String, String>>,
    blobs: Mutex<HashMap<String, String>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    transfer: Mutex<TransferBehavior>,
    next_id: AtomicU64,
    pub fail_lock: AtomicBool,
    pub fail_unlock: AtomicBool,
    pub fail_get: AtomicBool,
    pub fail_put: AtomicBool,
    pub transfer_started: Notify,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            transfer: Mutex::new(TransferBehavior::Succeed),
            next_id: AtomicU64::new(1),
            fail_lock: AtomicBool::new(false),
            fail_unlock: AtomicBool::new(false),
            fail_get: AtomicBool::new(false),
            fail_put: AtomicBool::new(false),
            transfer_started: Notify::new(),
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn set_transfer(&self, behavior: TransferBehavior) {
        *self.transfer.lock().unwrap() = behavior;
    }

    /// Marks a folder as locked by another client.
    pub fn hold_lock(&self, folder_id: &str, token: &str) {
        self.locks
            .lock()
            .unwrap()
            .insert(folder_id.to_string(), token.to_string());
    }

    pub fn held_lock(&self, folder_id: &str) -> Option<String> {
        self.locks.lock().unwrap().get(folder_id).cloned()
    }

    pub fn blob(&self, folder_id: &str) -> Option<String> {
        self.blobs.lock().unwrap().get(folder_id).cloned()
    }

    pub fn set_blob(&self, folder_id: &str, blob: &str) {
        self.blobs
            .lock()
            .unwrap()
            .insert(folder_id.to_string(), blob.to_string());
    }

    pub fn uploaded(&self, name: &str) -> Option<Vec<u8>> {
        self.uploads.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl LockApi for MockRemote {
    async fn lock_folder(
        &self,
        folder_id: &str,
        existing: Option<&LockToken>,
    ) -> E2eeResult<LockToken> {
        self.record(Call::Lock {
            folder_id: folder_id.to_string(),
            presented: existing.map(|t| t.as_str().to_string()),
        });
        if self.fail_lock.load(Ordering::SeqCst) {
            return Err(E2eeError::Api("lock endpoint unavailable".into()));
        }

        let mut locks = self.locks.lock().unwrap();
        match locks.get(folder_id) {
            Some(held) if existing.map(|t| t.as_str()) == Some(held.as_str()) => {
                Ok(LockToken::new(held.clone()))
            }
            Some(_) => Err(E2eeError::LockContention(format!(
                "folder {folder_id} is locked"
            ))),
            None => {
                let token = format!("token-{}", self.next());
                locks.insert(folder_id.to_string(), token.clone());
                Ok(LockToken::new(token))
            }
        }
    }

    async fn unlock_folder(&self, folder_id: &str, token: &LockToken) -> E2eeResult<()> {
        self.record(Call::Unlock {
            folder_id: folder_id.to_string(),
            token: token.as_str().to_string(),
        });
        if self.fail_unlock.load(Ordering::SeqCst) {
            return Err(E2eeError::Api("unlock endpoint unavailable".into()));
        }

        let mut locks = self.locks.lock().unwrap();
        if locks.get(folder_id).map(String::as_str) == Some(token.as_str()) {
            locks.remove(folder_id);
            Ok(())
        } else {
            Err(E2eeError::NotFound(format!("lock on folder {folder_id}")))
        }
    }
}

#[async_trait]
impl MetadataApi for MockRemote {
    async fn get_metadata(
        &self,
        folder_id: &str,
        _token: &LockToken,
    ) -> E2eeResult<Option<String>> {
        self.record(Call::GetMetadata {
            folder_id: folder_id.to_string(),
        });
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(E2eeError::Api("metadata endpoint unavailable".into()));
        }
        Ok(self.blob(folder_id))
    }

    async fn put_metadata(
        &self,
        folder_id: &str,
        token: &LockToken,
        blob: &str,
        mode: CatalogWriteMode,
    ) -> E2eeResult<()> {
        self.record(Call::PutMetadata {
            folder_id: folder_id.to_string(),
            mode,
        });
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(E2eeError::Api("HTTP 500".into()));
        }
        if self.held_lock(folder_id).as_deref() != Some(token.as_str()) {
            return Err(E2eeError::Api("HTTP 403: folder not locked".into()));
        }

        let exists = self.blob(folder_id).is_some();
        match (mode, exists) {
            (CatalogWriteMode::Create, true) => {
                Err(E2eeError::Api("HTTP 409: catalog exists".into()))
            }
            (CatalogWriteMode::Replace, false) => {
                Err(E2eeError::Api("HTTP 404: no catalog".into()))
            }
            _ => {
                self.set_blob(folder_id, blob);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TransferApi for MockRemote {
    async fn upload(
        &self,
        request: TransferRequest,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> E2eeResult<TransferReceipt> {
        self.record(Call::Upload {
            folder_id: request.folder_id.clone(),
            destination_name: request.destination_name.clone(),
            size: request.ciphertext.len(),
        });
        let total = request.ciphertext.len() as u64;
        let behavior = self.transfer.lock().unwrap().clone();

        match behavior {
            TransferBehavior::Succeed => {
                if let Some(report) = &progress {
                    report(TransferProgress {
                        bytes_sent: total / 2,
                        total_bytes: total,
                    });
                    report(TransferProgress {
                        bytes_sent: total,
                        total_bytes: total,
                    });
                }
                let n = self.next();
                self.uploads
                    .lock()
                    .unwrap()
                    .insert(request.destination_name, request.ciphertext.to_vec());
                Ok(TransferReceipt {
                    remote_id: format!("file-{n}"),
                    etag: Some(format!("etag-{n}")),
                    timestamp: Utc::now(),
                })
            }
            TransferBehavior::Fail(reason) => Err(E2eeError::Api(reason)),
            TransferBehavior::WaitForCancel => {
                if let Some(report) = &progress {
                    report(TransferProgress {
                        bytes_sent: total / 4,
                        total_bytes: total,
                    });
                }
                self.transfer_started.notify_one();
                cancel.cancelled().await;
                Err(E2eeError::Cancelled)
            }
        }
    }
}

/// Server capabilities this client can write.
pub fn writable_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        e2ee_enabled: true,
        e2ee_api_version: Some("1.2".to_string()),
    }
}

/// A fully wired orchestrator over a [`MockRemote`].
pub struct Harness {
    pub dir: TempDir,
    pub config: E2eeConfig,
    pub remote: Arc<MockRemote>,
    pub account_key: Arc<AccountKeyPair>,
    pub cache: LockCache,
    pub locks: Arc<LockManager>,
    pub store: Arc<MemoryCatalogStore>,
    pub metadata: Arc<MetadataSynchronizer>,
    pub jobs: Arc<MemoryJobRegistry>,
    pub orchestrator: UploadOrchestrator,
    pub notifications: mpsc::Receiver<UploadNotification>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = E2eeConfig::for_dir(dir.path(), "http://unused.invalid");
        Self::with_config(dir, config).await
    }

    pub async fn with_config(dir: TempDir, config: E2eeConfig) -> Self {
        init_tracing();
        let remote = MockRemote::new();
        let account_key = Arc::new(generate_account_keypair());
        let cache = LockCache::new();
        let locks = Arc::new(LockManager::new(remote.clone(), ACCOUNT, cache.clone()));
        let store = Arc::new(MemoryCatalogStore::new());
        let metadata = Arc::new(MetadataSynchronizer::new(
            remote.clone(),
            store.clone(),
            account_key.clone(),
        ));
        let jobs = Arc::new(MemoryJobRegistry::new());

        let (orchestrator, notifications) = create_upload_orchestrator(
            config.clone(),
            locks.clone(),
            metadata.clone(),
            remote.clone(),
            jobs.clone(),
        );
        orchestrator.set_capabilities(writable_capabilities()).await;

        Self {
            dir,
            config,
            remote,
            account_key,
            cache,
            locks,
            store,
            metadata,
            jobs,
            orchestrator,
            notifications,
        }
    }

    /// Writes a plaintext file of `size` bytes into the scratch directory.
    pub fn write_file(&self, name: &str, size: usize) -> PathBuf {
        write_file(self.dir.path(), name, size)
    }

    pub fn request(&self, folder_id: &str, path: &Path, logical_name: &str) -> UploadRequest {
        UploadRequest::new(folder_id, format!("/Encrypted/{folder_id}"), path, logical_name)
    }

    pub async fn upload(&self, folder_id: &str, logical_name: &str, size: usize) -> UploadOutcome {
        let path = self.write_file(logical_name, size);
        self.orchestrator
            .run(
                self.request(folder_id, &path, logical_name),
                CancellationToken::new(),
            )
            .await
    }

    /// Reads the folder's catalog as the server currently holds it.
    pub async fn server_catalog(&self, folder_id: &str) -> Option<FolderMetadataCatalog> {
        self.metadata
            .fetch_catalog(folder_id, &LockToken::new("inspection"))
            .await
            .unwrap()
    }

    /// Drains every notification sent so far.
    pub fn drain_notifications(&mut self) -> Vec<UploadNotification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }

    /// Names of files left in the ciphertext staging directory.
    pub fn staged_files(&self) -> Vec<String> {
        match std::fs::read_dir(&self.config.work_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Writes a file with deterministic content.
pub fn write_file(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path
}
