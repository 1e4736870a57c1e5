//! Delta upload: stage the unmatched ranges of a file as content-addressed
//! blocks and commit the ordered manifest
//!
//! Unmatched ranges are split into sub-blocks of at most `block_size` bytes.
//! A bounded pool of tasks reads, hashes and stages them; a block whose ID was
//! already claimed earlier in the same pass is recorded but not sent again.
//! Reused blocks never leave the store: the manifest simply names them again.

use super::BlobTarget;
use crate::error::{Error, Result};
use crate::signature::{block_id, BlockSignature, RollingHash, StrongHash};
use crate::storage::ObjectStore;
use crate::types::{SignatureSearchResult, UploadedBlock};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinSet;

/// Dedup registry and manifest entries, guarded by one lock so the
/// check-and-insert of a block ID is atomic
#[derive(Default)]
struct Registry {
    seen: HashSet<String>,
    blocks: Vec<UploadedBlock>,
}

impl Registry {
    /// Record a freshly hashed block; returns true if its content was
    /// already claimed in this pass
    fn claim(&mut self, block: BlockSignature, id: String) -> bool {
        let is_duplicate = !self.seen.insert(id.clone());
        self.blocks.push(UploadedBlock {
            block_id: id,
            offset: block.offset,
            size: block.size,
            signature: block,
            is_new: true,
            is_duplicate,
        });
        is_duplicate
    }
}

/// Split transfer ranges into `(offset, len)` sub-blocks of at most
/// `block_size` bytes
pub fn split_ranges(result: &SignatureSearchResult, block_size: usize) -> Vec<(u64, usize)> {
    let mut sub_blocks = Vec::new();
    for range in &result.ranges_to_transfer {
        let mut offset = range.begin as u64;
        let end = range.end as u64 + 1;
        while offset < end {
            let len = (end - offset).min(block_size as u64) as usize;
            sub_blocks.push((offset, len));
            offset += len as u64;
        }
    }
    sub_blocks
}

/// Stage every unmatched byte of `local_path`, then commit the manifest.
///
/// Returns the manifest in offset order; the caller derives the new
/// signature from it. Nothing is committed if any block fails to stage.
pub async fn upload_delta(
    store: Arc<dyn ObjectStore>,
    target: &BlobTarget,
    local_path: &Path,
    result: &SignatureSearchResult,
    block_size: usize,
    parallelism: usize,
) -> Result<Vec<UploadedBlock>> {
    if block_size == 0 || block_size > u32::MAX as usize {
        return Err(Error::config(format!("invalid block size {}", block_size)));
    }
    let parallelism = parallelism.max(1);

    let sub_blocks = split_ranges(result, block_size);
    let registry = Arc::new(Mutex::new(Registry::default()));

    tracing::debug!(
        blob = %target.blob,
        sub_blocks = sub_blocks.len(),
        reused = result.reusable_blocks.len(),
        parallelism,
        "Staging blocks"
    );

    // Admit a new task only when a running one has finished
    let mut tasks = JoinSet::new();
    for (offset, len) in sub_blocks {
        if tasks.len() >= parallelism {
            join_next(&mut tasks).await?;
        }

        let store = Arc::clone(&store);
        let target = target.clone();
        let path = local_path.to_path_buf();
        let registry = Arc::clone(&registry);
        tasks.spawn(async move { stage_block(store, target, path, offset, len, registry).await });
    }

    // Barrier: every staged block must land before the manifest is built
    while !tasks.is_empty() {
        join_next(&mut tasks).await?;
    }

    let mut blocks = std::mem::take(&mut registry.lock().blocks);
    blocks.extend(result.reusable_blocks.iter().map(|b| UploadedBlock {
        block_id: block_id(&b.strong),
        offset: b.offset,
        size: b.size,
        signature: b.clone(),
        is_new: false,
        is_duplicate: false,
    }));
    blocks.sort_by_key(|b| b.offset);

    commit_manifest(store.as_ref(), target, &blocks).await?;
    Ok(blocks)
}

/// Wait for one task; a panicked or cancelled task fails the upload
async fn join_next(tasks: &mut JoinSet<Result<()>>) -> Result<()> {
    match tasks.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(Error::storage(format!("block upload task failed: {}", e))),
        None => Ok(()),
    }
}

/// Read, hash and (unless already claimed) stage one sub-block
async fn stage_block(
    store: Arc<dyn ObjectStore>,
    target: BlobTarget,
    path: PathBuf,
    offset: u64,
    len: usize,
    registry: Arc<Mutex<Registry>>,
) -> Result<()> {
    let mut file = File::open(&path)
        .await
        .map_err(|e| Error::io("opening file for upload", e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| Error::io("seeking file", e))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .await
        .map_err(|e| Error::io("reading block", e))?;

    let signature = BlockSignature {
        offset: offset as i64,
        size: len as u32,
        rolling: RollingHash::init(&buf),
        strong: StrongHash::digest(&buf),
        block_number: 0,
    };
    let id = block_id(&signature.strong);

    let is_duplicate = registry.lock().claim(signature, id.clone());
    if is_duplicate {
        tracing::trace!(offset, block_id = %id, "Block content already staged");
        return Ok(());
    }

    store
        .put_block(&target.container, &target.blob, &id, Bytes::from(buf))
        .await?;
    tracing::trace!(offset, size = len, block_id = %id, "Staged block");
    Ok(())
}

/// Commit `blocks` (sorted by offset) as the blob's block list.
///
/// The blocks must tile the blob from offset 0 without gaps or overlaps.
pub async fn commit_manifest(store: &dyn ObjectStore, target: &BlobTarget, blocks: &[UploadedBlock]) -> Result<()> {
    let mut expected = 0i64;
    for block in blocks {
        if block.offset != expected {
            return Err(Error::integrity(format!(
                "manifest for {} has a {} at offset {}",
                target.blob,
                if block.offset > expected { "gap" } else { "overlap" },
                expected
            )));
        }
        expected += block.size as i64;
    }

    let ids: Vec<String> = blocks.iter().map(|b| b.block_id.clone()).collect();
    store.put_block_list(&target.container, &target.blob, &ids).await?;

    tracing::debug!(blob = %target.blob, blocks = ids.len(), size = expected, "Committed manifest");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::build_from_bytes;
    use crate::storage::{MemoryStore, Metadata};
    use crate::types::RemainingBytes;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn temp_file(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_split_ranges() {
        let result = SignatureSearchResult {
            ranges_to_transfer: vec![RemainingBytes::new(0, 24), RemainingBytes::new(40, 49)],
            reusable_blocks: Vec::new(),
        };
        assert_eq!(split_ranges(&result, 10), vec![(0, 10), (10, 10), (20, 5), (40, 10)]);
    }

    #[tokio::test]
    async fn test_fresh_upload_commits_in_order() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let file = temp_file(&data);
        let store = Arc::new(MemoryStore::with_container("c"));
        let target = BlobTarget::new("c", "obj");

        let result = SignatureSearchResult::whole_file(data.len() as u64);
        let blocks = upload_delta(store.clone(), &target, file.path(), &result, 1000, 3)
            .await
            .unwrap();

        assert_eq!(blocks.len(), 10);
        assert!(blocks.iter().all(|b| b.is_new));
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.offset, i as i64 * 1000);
        }
        assert_eq!(store.object_data("c", "obj").unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_identical_sub_blocks_staged_once() {
        let mut data = vec![0xAB; 2048];
        data.extend_from_slice(&[0x01; 512]);
        let file = temp_file(&data);
        let store = Arc::new(MemoryStore::with_container("c"));
        let target = BlobTarget::new("c", "obj");

        let result = SignatureSearchResult::whole_file(data.len() as u64);
        let blocks = upload_delta(store.clone(), &target, file.path(), &result, 1024, 4)
            .await
            .unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(store.put_block_calls(), 2);
        assert_eq!(blocks[0].block_id, blocks[1].block_id);
        assert_eq!(blocks.iter().filter(|b| b.is_duplicate).count(), 1);
        assert_eq!(store.object_data("c", "obj").unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_reused_blocks_are_not_sent() {
        let old: Vec<u8> = (0..4000u32).map(|i| (i % 253) as u8).collect();
        let store = Arc::new(MemoryStore::with_container("c"));
        let target = BlobTarget::new("c", "obj");

        let first = temp_file(&old);
        upload_delta(
            store.clone(),
            &target,
            first.path(),
            &SignatureSearchResult::whole_file(old.len() as u64),
            1000,
            2,
        )
        .await
        .unwrap();
        store.reset_counters();

        let mut new = old.clone();
        new.extend_from_slice(b"appended");
        let second = temp_file(&new);
        let sig = build_from_bytes(&old, 1000).unwrap();
        let result = crate::delta::search_bytes(&new, &sig);

        let blocks = upload_delta(store.clone(), &target, second.path(), &result, 1000, 2)
            .await
            .unwrap();

        assert_eq!(store.put_block_calls(), 1);
        assert_eq!(blocks.iter().filter(|b| !b.is_new).count(), 4);
        assert_eq!(store.object_data("c", "obj").unwrap(), Bytes::from(new));
    }

    /// Delegates to a `MemoryStore`, tracking how many `put_block` calls
    /// overlap
    struct GaugeStore {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for GaugeStore {
        fn name(&self) -> &'static str {
            "gauge"
        }

        async fn container_exists(&self, container: &str) -> Result<bool> {
            self.inner.container_exists(container).await
        }

        async fn object_exists(&self, container: &str, name: &str) -> Result<bool> {
            self.inner.object_exists(container, name).await
        }

        async fn get_object_metadata(&self, container: &str, name: &str) -> Result<Metadata> {
            self.inner.get_object_metadata(container, name).await
        }

        async fn set_object_metadata(&self, container: &str, name: &str, metadata: Metadata) -> Result<()> {
            self.inner.set_object_metadata(container, name, metadata).await
        }

        async fn put_block(&self, container: &str, name: &str, block_id: &str, data: Bytes) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = self.inner.put_block(container, name, block_id, data).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn put_block_list(&self, container: &str, name: &str, block_ids: &[String]) -> Result<()> {
            self.inner.put_block_list(container, name, block_ids).await
        }

        async fn put_object(&self, container: &str, name: &str, data: Bytes) -> Result<()> {
            self.inner.put_object(container, name, data).await
        }

        async fn download_range(&self, container: &str, name: &str, begin: u64, end: u64) -> Result<Bytes> {
            self.inner.download_range(container, name, begin, end).await
        }

        async fn download_full(&self, container: &str, name: &str) -> Result<Bytes> {
            self.inner.download_full(container, name).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_staging_never_exceeds_parallelism() {
        let data: Vec<u8> = (0..64_000u32).map(|i| (i * 7 % 251) as u8).collect();
        let file = temp_file(&data);
        let store = Arc::new(GaugeStore {
            inner: MemoryStore::with_container("c"),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let result = SignatureSearchResult::whole_file(data.len() as u64);
        let blocks = upload_delta(store.clone(), &BlobTarget::new("c", "obj"), file.path(), &result, 1000, 3)
            .await
            .unwrap();

        assert_eq!(blocks.len(), 64);
        assert_eq!(store.inner.put_block_calls(), 64);
        let peak = store.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "{} blocks staged at once", peak);
        assert!(peak > 1);
        assert_eq!(store.inner.object_data("c", "obj").unwrap(), Bytes::from(data));
    }

    #[tokio::test]
    async fn test_failed_block_prevents_commit() {
        let data = vec![7u8; 5000];
        let file = temp_file(&data);
        let store = Arc::new(MemoryStore::with_container("c"));
        store.fail_put_block(true);

        let result = SignatureSearchResult::whole_file(data.len() as u64);
        let err = upload_delta(store.clone(), &BlobTarget::new("c", "obj"), file.path(), &result, 1000, 2).await;

        assert!(matches!(err, Err(Error::Transport { .. })));
        assert_eq!(store.put_block_list_calls(), 0);
        assert!(store.object_data("c", "obj").is_none());
    }

    #[tokio::test]
    async fn test_commit_rejects_gaps() {
        let store = MemoryStore::with_container("c");
        let sig = build_from_bytes(b"0123456789", 5).unwrap();
        let blocks: Vec<UploadedBlock> = sig
            .blocks_by_offset()
            .into_iter()
            .skip(1)
            .map(|b| UploadedBlock {
                block_id: block_id(&b.strong),
                offset: b.offset,
                size: b.size,
                signature: b.clone(),
                is_new: true,
                is_duplicate: false,
            })
            .collect();

        let err = commit_manifest(&store, &BlobTarget::new("c", "obj"), &blocks).await;
        assert!(matches!(err, Err(Error::ReconstructionIntegrity { .. })));
    }
}
