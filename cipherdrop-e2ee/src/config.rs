//! Encrypted-folder protocol configuration.

use crate::error::{E2eeError, E2eeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the encrypted upload pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// Base URL of the server (e.g., "https://cloud.example.com").
    pub api_base_url: String,

    /// Largest plaintext accepted for an encrypted upload, in bytes.
    pub max_ciphertext_size_bytes: u64,

    /// Encryption API versions this client can write.
    pub supported_e2ee_versions: Vec<String>,

    /// Directory where ciphertext is staged before and after transfer.
    pub work_dir: PathBuf,

    /// Directory of locally cached previews, keyed by file identifier.
    pub preview_dir: PathBuf,

    /// Timeout for individual API requests in seconds.
    pub request_timeout_secs: u64,

    /// Size of the body chunks streamed during ciphertext transfer.
    pub transfer_chunk_size: usize,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("cipherdrop");
        Self {
            api_base_url: "https://cloud.example.com".to_string(),
            max_ciphertext_size_bytes: 500 * 1024 * 1024, // 500 MiB
            supported_e2ee_versions: vec!["1.1".to_string(), "1.2".to_string()],
            work_dir: base.join("staging"),
            preview_dir: base.join("previews"),
            request_timeout_secs: 30,
            transfer_chunk_size: 256 * 1024,
        }
    }
}

impl E2eeConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> E2eeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            E2eeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> E2eeResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(E2eeError::Config("api_base_url is empty".to_string()));
        }
        if self.max_ciphertext_size_bytes == 0 {
            return Err(E2eeError::Config(
                "max_ciphertext_size_bytes must be positive".to_string(),
            ));
        }
        if self.transfer_chunk_size == 0 {
            return Err(E2eeError::Config(
                "transfer_chunk_size must be positive".to_string(),
            ));
        }
        if self.supported_e2ee_versions.is_empty() {
            return Err(E2eeError::Config(
                "supported_e2ee_versions is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Config rooted in a scratch directory, for tests.
    pub fn for_dir(root: &Path, api_base_url: &str) -> Self {
        Self {
            api_base_url: api_base_url.to_string(),
            work_dir: root.join("staging"),
            preview_dir: root.join("previews"),
            ..Self::default()
        }
    }
}
