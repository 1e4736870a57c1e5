//! Directory-backed object store
//!
//! Layout under the root:
//!
//! ```text
//! <container>/<object>                              committed object
//! <container>/.deltablob/blocks/<object>/<hex id>   staged and committed blocks
//! <container>/.deltablob/meta/<object>.json         metadata sidecar
//! ```
//!
//! Committing a block list assembles the object in a temporary file next to
//! it and renames it into place, then drops blocks the new list no longer
//! references.

use super::{check_range, validate_name, Metadata, ObjectStore};
use crate::error::{Error, Result};
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Directory holding the store's bookkeeping inside each container
const INTERNAL_DIR: &str = ".deltablob";

/// Local filesystem object store
#[derive(Debug, Clone)]
pub struct LocalStore {
    /// Root directory; each container is a subdirectory
    root: PathBuf,
    retry: RetryConfig,
}

impl LocalStore {
    /// Create a store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            retry: RetryConfig::default(),
        }
    }

    /// Use a different retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Create a container directory
    pub async fn create_container(&self, container: &str) -> Result<()> {
        validate_container(container)?;
        fs::create_dir_all(self.root.join(container))
            .await
            .map_err(|e| Error::io("creating container", e))
    }

    /// Resolve a container, failing with a configuration error if absent
    async fn container_dir(&self, container: &str) -> Result<PathBuf> {
        validate_container(container)?;
        let dir = self.root.join(container);
        match fs::metadata(&dir).await {
            Ok(m) if m.is_dir() => Ok(dir),
            Ok(_) => Err(Error::config(format!("container '{}' is not a directory", container))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::config(format!("container '{}' does not exist", container)))
            }
            Err(e) => Err(Error::io("reading container metadata", e)),
        }
    }

    async fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_object(name)?;
        Ok(self.container_dir(container).await?.join(name))
    }

    async fn blocks_dir(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_object(name)?;
        Ok(self
            .container_dir(container)
            .await?
            .join(INTERNAL_DIR)
            .join("blocks")
            .join(name))
    }

    async fn meta_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_object(name)?;
        Ok(self
            .container_dir(container)
            .await?
            .join(INTERNAL_DIR)
            .join("meta")
            .join(format!("{}.json", name)))
    }

    /// Path of an object that must exist
    async fn existing_object(&self, container: &str, name: &str) -> Result<PathBuf> {
        let path = self.object_path(container, name).await?;
        if is_file(&path).await? {
            Ok(path)
        } else {
            Err(Error::not_found(container, name))
        }
    }
}

fn validate_container(container: &str) -> Result<()> {
    validate_name("container", container)?;
    if container.contains('/') {
        return Err(Error::config(format!("invalid container name '{}'", container)));
    }
    Ok(())
}

fn validate_object(name: &str) -> Result<()> {
    validate_name("object", name)?;
    if name.split('/').next() == Some(INTERNAL_DIR) {
        return Err(Error::config(format!("object name '{}' is reserved", name)));
    }
    Ok(())
}

/// Block IDs are base64 and may contain '/', so files are named by hex
fn block_file_name(block_id: &str) -> String {
    hex::encode(block_id.as_bytes())
}

async fn is_file(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(m) => Ok(m.is_file()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io("reading metadata", e)),
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io("creating directories", e))?;
    }
    Ok(())
}

/// Concatenate block files into `target` through a temp file, then remove
/// block files the list does not reference
fn assemble(target: &Path, blocks_dir: &Path, block_ids: &[String]) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| Error::storage(format!("object path {} has no parent", target.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| Error::io("creating directories", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io("creating temp file", e))?;
    let mut buf = Vec::new();
    for id in block_ids {
        let block_path = blocks_dir.join(block_file_name(id));
        let mut block = std::fs::File::open(&block_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::storage(format!("block {} was never staged", id))
            } else {
                Error::io("opening block", e)
            }
        })?;
        buf.clear();
        block
            .read_to_end(&mut buf)
            .map_err(|e| Error::io("reading block", e))?;
        tmp.write_all(&buf).map_err(|e| Error::io("writing object", e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("syncing object", e))?;
    tmp.persist(target)
        .map_err(|e| Error::io("renaming object into place", e.error))?;

    let keep: HashSet<String> = block_ids.iter().map(|id| block_file_name(id)).collect();
    for entry in std::fs::read_dir(blocks_dir).map_err(|e| Error::io("listing blocks", e))? {
        let entry = entry.map_err(|e| Error::io("listing blocks", e))?;
        if !keep.contains(entry.file_name().to_string_lossy().as_ref()) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale block");
            }
        }
    }

    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        validate_container(container)?;
        match fs::metadata(self.root.join(container)).await {
            Ok(m) => Ok(m.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io("reading container metadata", e)),
        }
    }

    async fn object_exists(&self, container: &str, name: &str) -> Result<bool> {
        let path = self.object_path(container, name).await?;
        is_file(&path).await
    }

    async fn get_object_metadata(&self, container: &str, name: &str) -> Result<Metadata> {
        self.existing_object(container, name).await?;
        let path = self.meta_path(container, name).await?;

        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| Error::storage(format!("invalid metadata for {}/{}: {}", container, name, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(Error::io("reading metadata", e)),
        }
    }

    async fn set_object_metadata(&self, container: &str, name: &str, metadata: Metadata) -> Result<()> {
        self.existing_object(container, name).await?;
        let path = self.meta_path(container, name).await?;
        let raw = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| Error::storage(format!("serializing metadata: {}", e)))?;

        create_parent(&path).await?;
        fs::write(&path, raw)
            .await
            .map_err(|e| Error::io("writing metadata", e))
    }

    async fn put_block(&self, container: &str, name: &str, block_id: &str, data: Bytes) -> Result<()> {
        let path = self.blocks_dir(container, name).await?.join(block_file_name(block_id));
        let (path, data) = (&path, &data);

        with_retry(&self.retry, "put_block", || async move {
            create_parent(path).await?;
            fs::write(path, data)
                .await
                .map_err(|e| Error::io("writing block", e))
        })
        .await
    }

    async fn put_block_list(&self, container: &str, name: &str, block_ids: &[String]) -> Result<()> {
        let target = self.object_path(container, name).await?;
        let blocks_dir = self.blocks_dir(container, name).await?;
        fs::create_dir_all(&blocks_dir)
            .await
            .map_err(|e| Error::io("creating block directory", e))?;

        let block_ids = block_ids.to_vec();
        with_retry(&self.retry, "put_block_list", || {
            let target = target.clone();
            let blocks_dir = blocks_dir.clone();
            let block_ids = block_ids.clone();
            async move {
                tokio::task::spawn_blocking(move || assemble(&target, &blocks_dir, &block_ids))
                    .await
                    .map_err(|e| Error::storage(format!("block list task failed: {}", e)))?
            }
        })
        .await?;

        tracing::debug!(container, name, blocks = block_ids.len(), "Committed block list");
        Ok(())
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(container, name).await?;
        let blocks_dir = self.blocks_dir(container, name).await?;
        let (path_ref, data) = (&path, &data);

        with_retry(&self.retry, "put_object", || async move {
            create_parent(path_ref).await?;
            fs::write(path_ref, data)
                .await
                .map_err(|e| Error::io("writing object", e))
        })
        .await?;

        // A whole-object write invalidates any block list
        match fs::remove_dir_all(&blocks_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io("removing stale blocks", e)),
        }
    }

    async fn download_range(&self, container: &str, name: &str, begin: u64, end: u64) -> Result<Bytes> {
        let path = self.existing_object(container, name).await?;
        let path = &path;

        with_retry(&self.retry, "download_range", || async move {
            let mut file = fs::File::open(path)
                .await
                .map_err(|e| Error::io("opening object", e))?;
            let len = file
                .metadata()
                .await
                .map_err(|e| Error::io("reading object metadata", e))?
                .len();
            check_range(container, name, begin, end, len)?;

            file.seek(SeekFrom::Start(begin))
                .await
                .map_err(|e| Error::io("seeking object", e))?;
            let mut buf = vec![0u8; (end - begin + 1) as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| Error::io("reading range", e))?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn download_full(&self, container: &str, name: &str) -> Result<Bytes> {
        let path = self.existing_object(container, name).await?;
        let path = &path;

        with_retry(&self.retry, "download_full", || async move {
            fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| Error::io("reading object", e))
        })
        .await
    }
}
