//! Folder catalog fetch, merge and push.
//!
//! A catalog travels as a JSON document. Its metadata keys are sealed to the
//! account's X25519 public key, and each file record carries its file key,
//! name and mime type encrypted under the metadata key it references:
//!
//! ```text
//! {
//!   "metadata": { "metadataKeys": { "0": <sealed envelope> }, "version": 1 },
//!   "files": [
//!     { "identifier": "…", "encrypted": "<base64>", "initializationVector": "…",
//!       "authenticationTag": "…", "metadataKey": 0 }
//!   ]
//! }
//! ```
//!
//! The lock token is the only concurrency control. Whether a push creates
//! or replaces the catalog depends solely on whether a catalog existed when
//! it was fetched.

use crate::catalog_store::CatalogStore;
use crate::encryption::EncryptionEngine;
use crate::error::MetadataError;
use crate::remote::MetadataApi;
use crate::types::{CatalogWriteMode, EncryptedFileEntry, FolderMetadataCatalog, LockToken};
use base64::{engine::general_purpose::STANDARD, Engine};
use cipherdrop_crypto::{
    decrypt_string, encrypt_string, open_key, seal_key, AccountKeyPair, DerivedKey,
    SealedEnvelope, NONCE_SIZE, TAG_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Catalog document version written by this client.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    metadata: CatalogHeader,
    #[serde(default)]
    files: Vec<FileRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogHeader {
    metadata_keys: BTreeMap<u32, SealedEnvelope>,
    version: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileRecord {
    identifier: String,
    encrypted: String,
    initialization_vector: String,
    authentication_tag: String,
    metadata_key: u32,
}

#[derive(Serialize, Deserialize)]
struct EncryptedFilePayload {
    key: String,
    filename: String,
    mimetype: String,
    version: u32,
}

fn decode_fixed<const N: usize>(field: &str, encoded: &str) -> Result<[u8; N], String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| format!("{field} is not base64: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("{field} has {} bytes, expected {N}", b.len()))
}

/// Serializes a catalog into its wire document.
fn encode_catalog(
    catalog: &FolderMetadataCatalog,
    account_key: &AccountKeyPair,
) -> Result<String, String> {
    let sealed = seal_key(&catalog.metadata_key, account_key.public_key())
        .map_err(|e| format!("cannot seal metadata key: {e}"))?;

    let mut files = Vec::with_capacity(catalog.entries.len());
    for entry in &catalog.entries {
        let payload = EncryptedFilePayload {
            key: STANDARD.encode(entry.file_key.as_bytes()),
            filename: entry.logical_file_name.clone(),
            mimetype: entry.mime_type.clone(),
            version: CATALOG_VERSION,
        };
        let json = serde_json::to_string(&payload).map_err(|e| e.to_string())?;
        let encrypted = encrypt_string(&catalog.metadata_key, &json)
            .map_err(|e| format!("cannot encrypt {}: {e}", entry.logical_file_name))?;

        files.push(FileRecord {
            identifier: entry.obfuscated_identifier.clone(),
            encrypted,
            initialization_vector: STANDARD.encode(entry.initialization_vector),
            authentication_tag: STANDARD.encode(entry.authentication_tag),
            metadata_key: catalog.metadata_key_index,
        });
    }

    let document = CatalogDocument {
        metadata: CatalogHeader {
            metadata_keys: BTreeMap::from([(catalog.metadata_key_index, sealed)]),
            version: CATALOG_VERSION,
        },
        files,
    };
    serde_json::to_string(&document).map_err(|e| e.to_string())
}

/// Parses and decrypts a wire document.
fn decode_catalog(
    folder_id: &str,
    blob: &str,
    account_key: &AccountKeyPair,
) -> Result<FolderMetadataCatalog, String> {
    let document: CatalogDocument =
        serde_json::from_str(blob).map_err(|e| format!("malformed document: {e}"))?;

    if document.metadata.version != CATALOG_VERSION {
        return Err(format!(
            "unsupported catalog version {}",
            document.metadata.version
        ));
    }

    let mut keys: BTreeMap<u32, DerivedKey> = BTreeMap::new();
    for (index, envelope) in &document.metadata.metadata_keys {
        let key = open_key(envelope, account_key)
            .map_err(|e| format!("cannot open metadata key {index}: {e}"))?;
        keys.insert(*index, key);
    }

    let (metadata_key_index, metadata_key) = keys
        .iter()
        .next_back()
        .map(|(i, k)| (*i, k.clone()))
        .ok_or_else(|| "catalog carries no metadata key".to_string())?;

    let mut entries = Vec::with_capacity(document.files.len());
    for record in document.files {
        let key = keys.get(&record.metadata_key).ok_or_else(|| {
            format!(
                "{} references unknown metadata key {}",
                record.identifier, record.metadata_key
            )
        })?;
        let json = decrypt_string(key, &record.encrypted)
            .map_err(|e| format!("cannot decrypt {}: {e}", record.identifier))?;
        let payload: EncryptedFilePayload = serde_json::from_str(&json)
            .map_err(|e| format!("{} has a malformed payload: {e}", record.identifier))?;
        let file_key = DerivedKey::from_slice(&decode_fixed::<32>("key", &payload.key)?)
            .map_err(|e| e.to_string())?;

        entries.push(EncryptedFileEntry {
            logical_file_name: payload.filename,
            obfuscated_identifier: record.identifier,
            file_key,
            initialization_vector: decode_fixed::<NONCE_SIZE>(
                "initializationVector",
                &record.initialization_vector,
            )?,
            authentication_tag: decode_fixed::<TAG_SIZE>(
                "authenticationTag",
                &record.authentication_tag,
            )?,
            mime_type: payload.mimetype,
            local_ciphertext_path: None,
        });
    }

    Ok(FolderMetadataCatalog {
        folder_id: folder_id.to_string(),
        metadata_key,
        metadata_key_index,
        entries,
    })
}

/// Fetches, merges and pushes folder catalogs.
pub struct MetadataSynchronizer {
    api: Arc<dyn MetadataApi>,
    store: Arc<dyn CatalogStore>,
    account_key: Arc<AccountKeyPair>,
}

impl MetadataSynchronizer {
    pub fn new(
        api: Arc<dyn MetadataApi>,
        store: Arc<dyn CatalogStore>,
        account_key: Arc<AccountKeyPair>,
    ) -> Self {
        Self {
            api,
            store,
            account_key,
        }
    }

    /// Fetches and decrypts a folder's catalog.
    ///
    /// `Ok(None)` means the folder has no catalog yet.
    pub async fn fetch_catalog(
        &self,
        folder_id: &str,
        token: &LockToken,
    ) -> Result<Option<FolderMetadataCatalog>, MetadataError> {
        let blob = self
            .api
            .get_metadata(folder_id, token)
            .await
            .map_err(|e| MetadataError::FetchFailed {
                folder_id: folder_id.to_string(),
                reason: e.to_string(),
            })?;

        let Some(blob) = blob.filter(|b| !b.trim().is_empty()) else {
            debug!("folder {folder_id} has no catalog yet");
            return Ok(None);
        };

        let mut catalog = decode_catalog(folder_id, &blob, &self.account_key).map_err(|reason| {
            MetadataError::Corrupt {
                folder_id: folder_id.to_string(),
                reason,
            }
        })?;

        match self.store.get(folder_id).await {
            Ok(known) => {
                let local: HashMap<String, _> = known
                    .into_iter()
                    .filter_map(|e| e.local_ciphertext_path.map(|p| (e.obfuscated_identifier, p)))
                    .collect();
                for entry in &mut catalog.entries {
                    entry.local_ciphertext_path =
                        local.get(&entry.obfuscated_identifier).cloned();
                }
            }
            Err(e) => warn!("cannot read local catalog for folder {folder_id}: {e}"),
        }

        if let Err(e) = self.store.put(folder_id, &catalog.entries).await {
            warn!("cannot record catalog for folder {folder_id}: {e}");
        }

        debug!(
            "fetched catalog for folder {folder_id}: {} entries, key index {}",
            catalog.len(),
            catalog.metadata_key_index
        );
        Ok(Some(catalog))
    }

    /// Adds an entry, replacing any entry with the same logical name.
    ///
    /// An existing catalog keeps its metadata key and index. Without one, a
    /// fresh key is generated at index 0.
    pub fn merge_entry(
        &self,
        folder_id: &str,
        catalog: Option<FolderMetadataCatalog>,
        entry: EncryptedFileEntry,
    ) -> FolderMetadataCatalog {
        let mut catalog = catalog.unwrap_or_else(|| FolderMetadataCatalog {
            folder_id: folder_id.to_string(),
            metadata_key: EncryptionEngine::generate_folder_key(),
            metadata_key_index: 0,
            entries: Vec::new(),
        });

        let before = catalog.entries.len();
        catalog
            .entries
            .retain(|e| e.logical_file_name != entry.logical_file_name);
        if catalog.entries.len() != before {
            debug!(
                "superseding {} in folder {folder_id}",
                entry.logical_file_name
            );
        }
        catalog.entries.push(entry);
        catalog
    }

    /// Encrypts and writes a catalog under the folder's lock.
    pub async fn push_catalog(
        &self,
        folder_id: &str,
        token: &LockToken,
        catalog: &FolderMetadataCatalog,
        mode: CatalogWriteMode,
    ) -> Result<(), MetadataError> {
        let blob = encode_catalog(catalog, &self.account_key).map_err(|reason| {
            MetadataError::Encoding {
                folder_id: folder_id.to_string(),
                reason,
            }
        })?;

        self.api
            .put_metadata(folder_id, token, &blob, mode)
            .await
            .map_err(|e| MetadataError::PushRejected {
                folder_id: folder_id.to_string(),
                reason: e.to_string(),
            })?;

        if let Err(e) = self.store.put(folder_id, &catalog.entries).await {
            warn!("cannot record catalog for folder {folder_id}: {e}");
        }

        info!(
            "pushed catalog for folder {folder_id} ({mode:?}, {} entries)",
            catalog.len()
        );
        Ok(())
    }
}
