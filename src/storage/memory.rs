//! In-process object store
//!
//! Keeps containers, staged blocks and committed objects in memory and counts
//! the calls made against it. Used by tests and for dry runs.

use super::{check_range, validate_name, Metadata, ObjectStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
struct StoredObject {
    data: Bytes,
    /// Committed blocks, addressable by a later block list
    blocks: HashMap<String, Bytes>,
    metadata: Metadata,
}

#[derive(Default)]
struct Container {
    objects: HashMap<String, StoredObject>,
    /// Blocks staged per object name, not yet committed
    staged: HashMap<String, HashMap<String, Bytes>>,
}

/// Object store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    containers: Mutex<HashMap<String, Container>>,
    put_block_calls: AtomicUsize,
    put_block_list_calls: AtomicUsize,
    range_requests: AtomicUsize,
    bytes_downloaded: AtomicU64,
    fail_put_block: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `container`
    pub fn with_container(container: &str) -> Self {
        let store = Self::new();
        store.create_container(container);
        store
    }

    /// Create a container (no-op if it exists)
    pub fn create_container(&self, container: &str) {
        self.containers.lock().entry(container.to_string()).or_default();
    }

    /// Committed content of an object, if any
    pub fn object_data(&self, container: &str, name: &str) -> Option<Bytes> {
        self.containers
            .lock()
            .get(container)
            .and_then(|c| c.objects.get(name))
            .map(|o| o.data.clone())
    }

    /// Number of `put_block` calls that reached the store
    pub fn put_block_calls(&self) -> usize {
        self.put_block_calls.load(Ordering::SeqCst)
    }

    /// Number of `put_block_list` calls that committed an object
    pub fn put_block_list_calls(&self) -> usize {
        self.put_block_list_calls.load(Ordering::SeqCst)
    }

    /// Number of `download_range` calls served
    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    /// Bytes returned by `download_range` and `download_full`
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::SeqCst)
    }

    /// Reset all call counters
    pub fn reset_counters(&self) {
        self.put_block_calls.store(0, Ordering::SeqCst);
        self.put_block_list_calls.store(0, Ordering::SeqCst);
        self.range_requests.store(0, Ordering::SeqCst);
        self.bytes_downloaded.store(0, Ordering::SeqCst);
    }

    /// Make every following `put_block` fail with a transport error
    pub fn fail_put_block(&self, fail: bool) {
        self.fail_put_block.store(fail, Ordering::SeqCst);
    }

    fn in_container<T>(&self, container: &str, f: impl FnOnce(&mut Container) -> Result<T>) -> Result<T> {
        let mut containers = self.containers.lock();
        let c = containers
            .get_mut(container)
            .ok_or_else(|| Error::config(format!("container '{}' does not exist", container)))?;
        f(c)
    }

    fn with_object<T>(&self, container: &str, name: &str, f: impl FnOnce(&mut StoredObject) -> T) -> Result<T> {
        self.in_container(container, |c| {
            c.objects
                .get_mut(name)
                .map(f)
                .ok_or_else(|| Error::not_found(container, name))
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        Ok(self.containers.lock().contains_key(container))
    }

    async fn object_exists(&self, container: &str, name: &str) -> Result<bool> {
        self.in_container(container, |c| Ok(c.objects.contains_key(name)))
    }

    async fn get_object_metadata(&self, container: &str, name: &str) -> Result<Metadata> {
        self.with_object(container, name, |o| o.metadata.clone())
    }

    async fn set_object_metadata(&self, container: &str, name: &str, metadata: Metadata) -> Result<()> {
        self.with_object(container, name, |o| o.metadata = metadata)
    }

    async fn put_block(&self, container: &str, name: &str, block_id: &str, data: Bytes) -> Result<()> {
        validate_name("object", name)?;
        self.put_block_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_put_block.load(Ordering::SeqCst) {
            return Err(Error::transport(format!("injected failure staging block {}", block_id)));
        }

        self.in_container(container, |c| {
            c.staged
                .entry(name.to_string())
                .or_default()
                .insert(block_id.to_string(), data);
            Ok(())
        })
    }

    async fn put_block_list(&self, container: &str, name: &str, block_ids: &[String]) -> Result<()> {
        validate_name("object", name)?;

        self.in_container(container, |c| {
            let staged = c.staged.remove(name).unwrap_or_default();
            let committed = c.objects.get(name).map(|o| &o.blocks);

            let mut data = BytesMut::new();
            let mut blocks = HashMap::new();
            for id in block_ids {
                let block = staged
                    .get(id)
                    .or_else(|| committed.and_then(|b| b.get(id)))
                    .ok_or_else(|| Error::storage(format!("block {} of {}/{} was never staged", id, container, name)))?
                    .clone();
                data.extend_from_slice(&block);
                blocks.insert(id.clone(), block);
            }

            let metadata = c.objects.remove(name).map(|o| o.metadata).unwrap_or_default();
            c.objects.insert(
                name.to_string(),
                StoredObject {
                    data: data.freeze(),
                    blocks,
                    metadata,
                },
            );
            Ok(())
        })?;

        self.put_block_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
        validate_name("object", name)?;

        self.in_container(container, |c| {
            c.staged.remove(name);
            let metadata = c.objects.remove(name).map(|o| o.metadata).unwrap_or_default();
            c.objects.insert(
                name.to_string(),
                StoredObject {
                    data,
                    blocks: HashMap::new(),
                    metadata,
                },
            );
            Ok(())
        })
    }

    async fn download_range(&self, container: &str, name: &str, begin: u64, end: u64) -> Result<Bytes> {
        let data = self.with_object(container, name, |o| o.data.clone())?;
        check_range(container, name, begin, end, data.len() as u64)?;

        self.range_requests.fetch_add(1, Ordering::SeqCst);
        self.bytes_downloaded.fetch_add(end - begin + 1, Ordering::SeqCst);
        Ok(data.slice(begin as usize..=end as usize))
    }

    async fn download_full(&self, container: &str, name: &str) -> Result<Bytes> {
        let data = self.with_object(container, name, |o| o.data.clone())?;
        self.bytes_downloaded.fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(data)
    }
}
