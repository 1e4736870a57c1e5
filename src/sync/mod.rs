//! Sync orchestration
//!
//! [`SyncContext`] carries the configuration and the object store through an
//! upload or download. Each blob `<name>` is accompanied by its signature,
//! stored as the object `<name><signature_suffix>`. The blob's metadata records
//! the BLAKE3 hash of that signature so a signature left behind by an
//! interrupted sync is never trusted.

pub mod delta_download;
pub mod delta_upload;

use crate::config::Config;
use crate::delta;
use crate::error::{Error, Result};
use crate::signature::{self, content_hash, SignatureSet};
use crate::storage::{Metadata, ObjectStore};
use crate::types::{DownloadReport, SignatureSearchResult, UploadReport};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub use delta_download::{download_with_reuse, fetch_ranges, plan_reconstruction, ReconstructionPlan};
pub use delta_upload::{commit_manifest, upload_delta};

/// Metadata key: BLAKE3 hex of the blob content
pub const CONTENT_HASH_KEY: &str = "deltablob_content_hash";

/// Metadata key: block size used for the blob's newest blocks
pub const BLOCK_SIZE_KEY: &str = "deltablob_block_size";

/// Metadata key: BLAKE3 hex of the encoded signature that describes the blob
pub const SIGNATURE_HASH_KEY: &str = "deltablob_signature_hash";

/// A blob in a container
#[derive(Debug, Clone)]
pub struct BlobTarget {
    pub container: String,
    pub blob: String,
}

impl BlobTarget {
    pub fn new(container: impl Into<String>, blob: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            blob: blob.into(),
        }
    }
}

/// Explicit context for sync operations
#[derive(Clone)]
pub struct SyncContext {
    config: Config,
    store: Arc<dyn ObjectStore>,
}

impl SyncContext {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn require_container(&self, container: &str) -> Result<()> {
        if self.store.container_exists(container).await? {
            Ok(())
        } else {
            Err(Error::config(format!("container '{}' does not exist", container)))
        }
    }

    /// Fetch and decode the published signature of a blob.
    ///
    /// Returns `None` when the blob or its signature is missing, or when the
    /// signature is not the one recorded in the blob's metadata.
    pub async fn fetch_signature(&self, container: &str, blob: &str) -> Result<Option<SignatureSet>> {
        if !self.store.object_exists(container, blob).await? {
            return Ok(None);
        }

        let metadata = self.store.get_object_metadata(container, blob).await?;
        let Some(expected) = metadata.get(SIGNATURE_HASH_KEY) else {
            tracing::debug!(container, blob, "Blob has no recorded signature");
            return Ok(None);
        };

        let sig_name = self.config.signature_name(blob);
        if !self.store.object_exists(container, &sig_name).await? {
            tracing::debug!(container, signature = %sig_name, "Signature object missing");
            return Ok(None);
        }

        let raw = self.store.download_full(container, &sig_name).await?;
        if content_hash(&raw) != *expected {
            tracing::warn!(container, signature = %sig_name, "Signature does not match blob, ignoring it");
            return Ok(None);
        }

        Ok(Some(signature::decode_bytes(&raw)?))
    }

    /// Upload `local` to `container/blob`, sending only blocks the current
    /// blob does not already hold
    pub async fn upload(&self, local: &Path, container: &str, blob: &str) -> Result<UploadReport> {
        let start = Instant::now();
        self.require_container(container).await?;
        let target = BlobTarget::new(container, blob);

        let file_size = tokio::fs::metadata(local)
            .await
            .map_err(|e| Error::io("reading local file metadata", e))?
            .len();
        let block_size = self.config.block_size_for(file_size)?;

        let result = match self.fetch_signature(container, blob).await? {
            Some(remote) => {
                tracing::debug!(blob, blocks = remote.block_count(), "Searching local file for remote blocks");
                let path = local.to_path_buf();
                tokio::task::spawn_blocking(move || delta::search(&path, &remote))
                    .await
                    .map_err(|e| Error::storage(format!("search task failed: {}", e)))??
            }
            None => {
                tracing::debug!(blob, "No usable signature, uploading whole file");
                SignatureSearchResult::whole_file(file_size)
            }
        };

        // Until the new signature is published, the blob must not vouch for
        // the old one
        if self.store.object_exists(container, blob).await? {
            self.store.set_object_metadata(container, blob, Metadata::new()).await?;
        }

        let blocks = upload_delta(
            Arc::clone(&self.store),
            &target,
            local,
            &result,
            block_size,
            self.config.effective_parallelism(),
        )
        .await?;

        let new_sig = signature::signature_from_blocks(&blocks);
        let encoded = signature::encode_to_bytes(&new_sig)?;
        let sig_hash = content_hash(&encoded);
        self.store
            .put_object(container, &self.config.signature_name(blob), Bytes::from(encoded))
            .await?;

        let path = local.to_path_buf();
        let file_hash = tokio::task::spawn_blocking(move || signature::content_hash_file(&path))
            .await
            .map_err(|e| Error::storage(format!("hash task failed: {}", e)))??;

        let mut metadata = Metadata::new();
        metadata.insert(CONTENT_HASH_KEY.to_string(), file_hash);
        metadata.insert(BLOCK_SIZE_KEY.to_string(), block_size.to_string());
        metadata.insert(SIGNATURE_HASH_KEY.to_string(), sig_hash);
        self.store.set_object_metadata(container, blob, metadata).await?;

        let report = UploadReport::from_blocks(&blocks);
        tracing::info!(
            container,
            blob,
            total = report.total_size,
            uploaded = report.bytes_uploaded,
            reused = report.bytes_reused,
            blocks_uploaded = report.blocks_uploaded,
            blocks_reused = report.blocks_reused,
            blocks_deduplicated = report.blocks_deduplicated,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Upload complete"
        );

        Ok(report)
    }

    /// Download `container/blob` to `local`, reusing matching local bytes
    pub async fn download(&self, container: &str, blob: &str, local: &Path) -> Result<DownloadReport> {
        let start = Instant::now();
        self.require_container(container).await?;
        let target = BlobTarget::new(container, blob);

        if !self.store.object_exists(container, blob).await? {
            return Err(Error::not_found(container, blob));
        }

        let metadata = self.store.get_object_metadata(container, blob).await?;
        let expected_hash = if self.config.verify_downloads {
            metadata.get(CONTENT_HASH_KEY).cloned()
        } else {
            None
        };

        let local_exists = tokio::fs::try_exists(local)
            .await
            .map_err(|e| Error::io("checking local file", e))?;

        let remote = if local_exists {
            self.fetch_signature(container, blob).await?
        } else {
            None
        };

        let report = match remote {
            Some(remote) => {
                download_with_reuse(self.store.as_ref(), &target, &remote, local, expected_hash.as_deref()).await?
            }
            None => {
                tracing::debug!(blob, local_exists, "Downloading whole blob");
                delta_download::download_full(self.store.as_ref(), &target, local, expected_hash.as_deref()).await?
            }
        };

        tracing::info!(
            container,
            blob,
            downloaded = report.bytes_downloaded,
            reused = report.bytes_reused,
            range_requests = report.range_requests,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Download complete"
        );

        Ok(report)
    }

    /// Compute the signature of a local file with the configured block size
    pub async fn sign(&self, local: &Path) -> Result<SignatureSet> {
        sign(&self.config, local).await
    }
}

/// Compute the signature of a local file with the block size `config`
/// chooses for it
pub async fn sign(config: &Config, local: &Path) -> Result<SignatureSet> {
    let file_size = tokio::fs::metadata(local)
        .await
        .map_err(|e| Error::io("reading local file metadata", e))?
        .len();
    let block_size = config.block_size_for(file_size)?;

    let path: PathBuf = local.to_path_buf();
    tokio::task::spawn_blocking(move || signature::build(&path, block_size))
        .await
        .map_err(|e| Error::storage(format!("signature task failed: {}", e)))?
}
