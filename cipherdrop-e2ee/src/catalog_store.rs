//! Local store of decrypted folder catalogs.
//!
//! The Metadata Synchronizer is the only writer. Readers get the entries of
//! the last catalog that was fetched or pushed for a folder.

use crate::error::E2eeResult;
use crate::types::EncryptedFileEntry;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Entries last recorded for a folder. Empty when nothing was recorded.
    async fn get(&self, folder_id: &str) -> E2eeResult<Vec<EncryptedFileEntry>>;

    async fn put(&self, folder_id: &str, entries: &[EncryptedFileEntry]) -> E2eeResult<()>;
}

/// In-memory catalog store.
#[derive(Clone, Default)]
pub struct MemoryCatalogStore {
    folders: Arc<RwLock<HashMap<String, Vec<EncryptedFileEntry>>>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn get(&self, folder_id: &str) -> E2eeResult<Vec<EncryptedFileEntry>> {
        Ok(self
            .folders
            .read()
            .await
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put(&self, folder_id: &str, entries: &[EncryptedFileEntry]) -> E2eeResult<()> {
        self.folders
            .write()
            .await
            .insert(folder_id.to_string(), entries.to_vec());
        Ok(())
    }
}

/// Catalog store keeping one JSON file per folder.
///
/// Files are named after a hash of the folder id and replaced atomically.
#[derive(Clone, Debug)]
pub struct FileCatalogStore {
    root: PathBuf,
}

impl FileCatalogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, folder_id: &str) -> PathBuf {
        let digest = Sha256::digest(folder_id.as_bytes());
        self.root.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl CatalogStore for FileCatalogStore {
    async fn get(&self, folder_id: &str) -> E2eeResult<Vec<EncryptedFileEntry>> {
        match tokio::fs::read(self.path_for(folder_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, folder_id: &str, entries: &[EncryptedFileEntry]) -> E2eeResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(folder_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
