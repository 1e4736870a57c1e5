//! Object stores for deltablob
//!
//! The sync core talks to storage only through [`ObjectStore`]. Objects are
//! block-addressable: blocks are staged under content-derived IDs and an
//! object becomes visible when an ordered block list is committed.

#[cfg(feature = "azure")]
pub mod azure;
pub mod local;
pub mod memory;

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "azure")]
pub use azure::AzureStore;
pub use local::LocalStore;
pub use memory::MemoryStore;

/// Object metadata: plain string pairs
pub type Metadata = HashMap<String, String>;

/// Block-addressable object storage.
///
/// Implementations retry transient faults themselves; errors returned from
/// these methods are terminal for the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of this store (for logging)
    fn name(&self) -> &'static str;

    /// Check if a container exists
    async fn container_exists(&self, container: &str) -> Result<bool>;

    /// Check if a committed object exists
    async fn object_exists(&self, container: &str, name: &str) -> Result<bool>;

    /// Read an object's metadata
    async fn get_object_metadata(&self, container: &str, name: &str) -> Result<Metadata>;

    /// Replace an object's metadata
    async fn set_object_metadata(&self, container: &str, name: &str, metadata: Metadata) -> Result<()>;

    /// Stage a block under `block_id` for a later `put_block_list`
    async fn put_block(&self, container: &str, name: &str, block_id: &str, data: Bytes) -> Result<()>;

    /// Commit the object as the concatenation of `block_ids`, in order.
    ///
    /// IDs may refer to blocks staged since the last commit or to blocks of
    /// the currently committed object.
    async fn put_block_list(&self, container: &str, name: &str, block_ids: &[String]) -> Result<()>;

    /// Write a whole object in one request
    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()>;

    /// Read the inclusive byte range `[begin, end]` of an object
    async fn download_range(&self, container: &str, name: &str, begin: u64, end: u64) -> Result<Bytes>;

    /// Read a whole object
    async fn download_full(&self, container: &str, name: &str) -> Result<Bytes>;
}

/// Build the store selected by the configuration
pub fn open_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let retry = RetryConfig::from(config);

    match config.store.backend {
        BackendKind::Local => {
            let root = config
                .store
                .root
                .clone()
                .ok_or_else(|| Error::config("store.root must be set for the local backend"))?;
            Ok(Arc::new(LocalStore::new(root).with_retry(retry)))
        }
        #[cfg(feature = "azure")]
        BackendKind::Azure => Ok(Arc::new(AzureStore::from_env(config.store.account.clone(), retry)?)),
        #[cfg(not(feature = "azure"))]
        BackendKind::Azure => Err(Error::config(
            "azure backend requested but deltablob was built without the `azure` feature",
        )),
    }
}

/// Reject object and container names that could escape a store's namespace
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        || name.contains('\\')
        || name.contains('\0');

    if bad {
        return Err(Error::config(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

/// Check an inclusive range against an object length
pub(crate) fn check_range(container: &str, name: &str, begin: u64, end: u64, len: u64) -> Result<()> {
    if begin > end || end >= len {
        return Err(Error::storage(format!(
            "range {}-{} outside {}/{} ({} bytes)",
            begin, end, container, name, len
        )));
    }
    Ok(())
}
