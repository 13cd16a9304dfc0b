//! Cached previews keyed by file id.

use crate::error::{E2eeError, E2eeResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct PreviewCache {
    root: PathBuf,
}

impl PreviewCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the preview for a file id.
    ///
    /// Ids come from the server, so anything that is not a single plain
    /// path component is rejected.
    pub fn path_for(&self, id: &str) -> E2eeResult<PathBuf> {
        if id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\', '\0']) {
            return Err(E2eeError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Moves a preview from a temporary id to a final id. Returns whether a
    /// preview existed.
    pub async fn relocate(&self, from_id: &str, to_id: &str) -> E2eeResult<bool> {
        let from = self.path_for(from_id)?;
        let to = self.path_for(to_id)?;
        match tokio::fs::rename(from, to).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a preview. Returns whether one existed.
    pub async fn purge(&self, id: &str) -> E2eeResult<bool> {
        match tokio::fs::remove_file(self.path_for(id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
