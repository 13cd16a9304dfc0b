//! Per-folder lock acquisition and release.
//!
//! The [`LockCache`] is the process-wide folder → token map. Only the
//! [`LockManager`] reads or writes it. A token stays cached until the server
//! confirms the unlock, so a failed release can be retried later by
//! [`LockManager::sweep_all`].
//!
//! The cache also tracks which folders are held by a live
//! [`FolderLockGuard`]. A cached token is only presented to the server when
//! no guard holds it, i.e. it was left behind by a job that could not
//! release. Another job for a held folder fails at Locking, the same outcome
//! the server gives a second client.

use crate::error::{E2eeError, LockError};
use crate::remote::LockApi;
use crate::types::{FolderLock, LockToken, SweepReport};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

type FolderKey = (String, String);

fn key(account: &str, folder_id: &str) -> FolderKey {
    (account.to_string(), folder_id.to_string())
}

/// Thread-safe cache of held folder locks, keyed by (account, folder).
#[derive(Clone)]
pub struct LockCache {
    locks: Arc<RwLock<HashMap<FolderKey, FolderLock>>>,
    holders: Arc<RwLock<HashMap<FolderKey, Arc<Mutex<()>>>>>,
}

impl LockCache {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            holders: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether a live guard in this process holds the folder.
    pub async fn is_held(&self, account: &str, folder_id: &str) -> bool {
        self.holders
            .read()
            .await
            .get(&key(account, folder_id))
            .is_some_and(|holder| holder.try_lock().is_err())
    }

    /// Claims the folder for one guard. `None` while another guard holds it.
    async fn try_claim(&self, account: &str, folder_id: &str) -> Option<OwnedMutexGuard<()>> {
        let mut holders = self.holders.write().await;
        let holder = holders
            .entry(key(account, folder_id))
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(holder).try_lock_owned().ok()
    }

    /// Records a lock for an account.
    pub async fn insert(&self, account: &str, lock: FolderLock) {
        self.locks
            .write()
            .await
            .insert((account.to_string(), lock.folder_id.clone()), lock);
    }

    /// Retrieves a cloned lock for an account's folder.
    pub async fn get(&self, account: &str, folder_id: &str) -> Option<FolderLock> {
        self.locks
            .read()
            .await
            .get(&key(account, folder_id))
            .cloned()
    }

    pub async fn remove(&self, account: &str, folder_id: &str) -> Option<FolderLock> {
        self.locks
            .write()
            .await
            .remove(&key(account, folder_id))
    }

    /// Returns every lock cached for an account.
    pub async fn for_account(&self, account: &str) -> Vec<FolderLock> {
        let mut locks: Vec<FolderLock> = self
            .locks
            .read()
            .await
            .iter()
            .filter(|((owner, _), _)| owner == account)
            .map(|(_, lock)| lock.clone())
            .collect();
        locks.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
        locks
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }
}

impl Default for LockCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Acquires and releases folder locks for one account.
pub struct LockManager {
    api: Arc<dyn LockApi>,
    account: String,
    cache: LockCache,
}

impl LockManager {
    pub fn new(api: Arc<dyn LockApi>, account: impl Into<String>, cache: LockCache) -> Self {
        Self {
            api,
            account: account.into(),
            cache,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn cache(&self) -> &LockCache {
        &self.cache
    }

    /// Returns the cached lock for a folder, if any.
    pub async fn cached(&self, folder_id: &str) -> Option<FolderLock> {
        self.cache.get(&self.account, folder_id).await
    }

    /// Locks a folder, presenting any cached token, and caches the result.
    ///
    /// Fails without contacting the server while a [`FolderLockGuard`] in
    /// this process holds the folder.
    pub async fn acquire(&self, folder_id: &str) -> Result<LockToken, LockError> {
        if self.cache.is_held(&self.account, folder_id).await {
            return Err(self.held_elsewhere(folder_id));
        }
        self.lock_remote(folder_id).await
    }

    fn held_elsewhere(&self, folder_id: &str) -> LockError {
        warn!("lock on folder {folder_id} is held by another job");
        LockError::Unavailable {
            folder_id: folder_id.to_string(),
            reason: "held by another job in this process".to_string(),
        }
    }

    async fn lock_remote(&self, folder_id: &str) -> Result<LockToken, LockError> {
        let existing = self.cache.get(&self.account, folder_id).await;
        let token = self
            .api
            .lock_folder(folder_id, existing.as_ref().map(|l| &l.token))
            .await
            .map_err(|e| {
                warn!("lock on folder {folder_id} unavailable: {e}");
                LockError::Unavailable {
                    folder_id: folder_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.cache
            .insert(
                &self.account,
                FolderLock {
                    folder_id: folder_id.to_string(),
                    token: token.clone(),
                    acquired_at: Utc::now(),
                },
            )
            .await;

        debug!(
            "locked folder {folder_id} (token {}, reused: {})",
            token.fingerprint(),
            existing.is_some()
        );
        Ok(token)
    }

    /// Unlocks a folder. An already released token is not an error.
    ///
    /// On failure the cached token is kept for [`LockManager::sweep_all`].
    pub async fn release(&self, folder_id: &str, token: &LockToken) -> Result<(), LockError> {
        match self.api.unlock_folder(folder_id, token).await {
            Ok(()) => {
                self.forget(folder_id, token).await;
                debug!("unlocked folder {folder_id} (token {})", token.fingerprint());
                Ok(())
            }
            Err(E2eeError::NotFound(_)) => {
                self.forget(folder_id, token).await;
                debug!(
                    "folder {folder_id} already unlocked (token {})",
                    token.fingerprint()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "unlock of folder {folder_id} failed, keeping token {}: {e}",
                    token.fingerprint()
                );
                Err(LockError::ReleaseFailed {
                    folder_id: folder_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drops the cache entry only if it still holds this token.
    async fn forget(&self, folder_id: &str, token: &LockToken) {
        if let Some(cached) = self.cache.get(&self.account, folder_id).await {
            if &cached.token == token {
                self.cache.remove(&self.account, folder_id).await;
            }
        }
    }

    /// Attempts to release every lock cached for this account.
    ///
    /// Folders held by a live guard are skipped; the guard releases them.
    pub async fn sweep_all(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for lock in self.cache.for_account(&self.account).await {
            if self.cache.is_held(&self.account, &lock.folder_id).await {
                debug!("sweep skips folder {}, still held", lock.folder_id);
                continue;
            }
            match self.release(&lock.folder_id, &lock.token).await {
                Ok(()) => report.released.push(lock.folder_id),
                Err(_) => report.failed.push(lock.folder_id),
            }
        }
        info!(
            "lock sweep for {}: {} released, {} failed",
            self.account,
            report.released.len(),
            report.failed.len()
        );
        report
    }

    /// Locks a folder and returns a guard that owns the release.
    ///
    /// Fails while another guard in this process holds the same folder.
    pub async fn acquire_scoped(
        self: &Arc<Self>,
        folder_id: &str,
    ) -> Result<FolderLockGuard, LockError> {
        let holder = self
            .cache
            .try_claim(&self.account, folder_id)
            .await
            .ok_or_else(|| self.held_elsewhere(folder_id))?;
        let token = self.lock_remote(folder_id).await?;
        Ok(FolderLockGuard {
            manager: Arc::clone(self),
            folder_id: folder_id.to_string(),
            token,
            holder: Some(holder),
            released: false,
        })
    }
}

/// A held folder lock that is released exactly once.
///
/// Call [`FolderLockGuard::release`] on every path. If the guard is dropped
/// without it (the owning task was aborted), a release is spawned on the
/// current runtime. The folder counts as held until that release finishes.
pub struct FolderLockGuard {
    manager: Arc<LockManager>,
    folder_id: String,
    token: LockToken,
    holder: Option<OwnedMutexGuard<()>>,
    released: bool,
}

impl std::fmt::Debug for FolderLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderLockGuard")
            .field("folder_id", &self.folder_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl FolderLockGuard {
    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let result = self.manager.release(&self.folder_id, &self.token).await;
        self.holder.take();
        result
    }
}

impl Drop for FolderLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let manager = Arc::clone(&self.manager);
        let folder_id = std::mem::take(&mut self.folder_id);
        let token = self.token.clone();
        let holder = self.holder.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("lock guard for folder {folder_id} dropped unreleased, releasing in background");
                handle.spawn(async move {
                    let _ = manager.release(&folder_id, &token).await;
                    drop(holder);
                });
            }
            Err(_) => {
                warn!(
                    "lock guard for folder {folder_id} dropped outside a runtime, token {} stays cached",
                    token.fingerprint()
                );
            }
        }
    }
}
