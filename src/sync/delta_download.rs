//! Reconstruction of a local file from reused local bytes and fetched ranges
//!
//! The local file is scanned against the remote signature. Remote blocks whose
//! content was found locally are copied from the local file; runs of blocks
//! that were not found are fetched with one range request per run. The result
//! is written to a temporary file beside the target and renamed over it only
//! once every byte is accounted for.

use super::BlobTarget;
use crate::delta::search_bytes;
use crate::error::{Error, Result};
use crate::mmap::LockedMmap;
use crate::signature::{SignatureSet, StrongSignature};
use crate::storage::ObjectStore;
use crate::types::{DownloadReport, RemainingBytes, SignatureSearchResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Where the bytes of one remote block come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// Copy from this offset of the existing local file
    Local { offset: u64 },
    /// Copy from a fetched range, starting `offset` bytes into it
    Fetched { range: usize, offset: u64 },
}

/// One block of the target file, in target order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStep {
    pub target_offset: u64,
    pub size: u32,
    pub source: BlockSource,
}

/// How to rebuild the target file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionPlan {
    pub steps: Vec<PlanStep>,
    /// Inclusive byte ranges of the remote object to fetch
    pub fetch_ranges: Vec<RemainingBytes>,
    pub total_size: u64,
}

impl ReconstructionPlan {
    /// Bytes that will be fetched from the store
    pub fn bytes_to_fetch(&self) -> u64 {
        self.fetch_ranges.iter().map(|r| r.len()).sum()
    }

    /// Bytes that will be copied from the local file
    pub fn bytes_reused(&self) -> u64 {
        self.total_size - self.bytes_to_fetch()
    }
}

/// Build a reconstruction plan.
///
/// `local_matches` is the result of scanning the local file against
/// `remote`: its reusable blocks carry local offsets. Remote blocks are walked
/// in target order; a block whose content is available locally is copied,
/// and consecutive unavailable blocks are merged into one fetch range.
pub fn plan_reconstruction(remote: &SignatureSet, local_matches: &SignatureSearchResult) -> Result<ReconstructionPlan> {
    let mut local: HashMap<(u32, StrongSignature), u64> = HashMap::new();
    for block in &local_matches.reusable_blocks {
        local.entry((block.size, block.strong)).or_insert(block.offset as u64);
    }

    let mut plan = ReconstructionPlan::default();
    let mut open_range: Option<RemainingBytes> = None;

    for block in remote.blocks_by_offset() {
        if block.offset as u64 != plan.total_size {
            return Err(Error::integrity(format!(
                "remote signature does not cover offset {} (next block starts at {})",
                plan.total_size, block.offset
            )));
        }

        let source = match local.get(&(block.size, block.strong)) {
            Some(&offset) => {
                if let Some(range) = open_range.take() {
                    plan.fetch_ranges.push(range);
                }
                BlockSource::Local { offset }
            }
            None => {
                let range = open_range.get_or_insert(RemainingBytes::new(block.offset, block.offset));
                range.end = block.end() - 1;
                BlockSource::Fetched {
                    range: plan.fetch_ranges.len(),
                    offset: (block.offset - range.begin) as u64,
                }
            }
        };

        plan.steps.push(PlanStep {
            target_offset: block.offset as u64,
            size: block.size,
            source,
        });
        plan.total_size += block.size as u64;
    }

    if let Some(range) = open_range {
        plan.fetch_ranges.push(range);
    }

    Ok(plan)
}

/// Fetch `ranges` of an object, one request per range
pub async fn fetch_ranges(store: &dyn ObjectStore, target: &BlobTarget, ranges: &[RemainingBytes]) -> Result<Vec<Bytes>> {
    let mut fetched = Vec::with_capacity(ranges.len());
    for range in ranges {
        let data = store
            .download_range(&target.container, &target.blob, range.begin as u64, range.end as u64)
            .await?;

        if data.len() as u64 != range.len() {
            return Err(Error::integrity(format!(
                "range {}-{} of {} returned {} bytes, expected {}",
                range.begin,
                range.end,
                target.blob,
                data.len(),
                range.len()
            )));
        }

        tracing::trace!(begin = range.begin, end = range.end, "Fetched range");
        fetched.push(data);
    }
    Ok(fetched)
}

/// Rebuild `local_path` as the remote object described by `remote`, reusing
/// whatever the current local file already holds.
///
/// When `expected_hash` is given the result must hash to it; otherwise the
/// original file is left untouched.
pub async fn download_with_reuse(
    store: &dyn ObjectStore,
    target: &BlobTarget,
    remote: &SignatureSet,
    local_path: &Path,
    expected_hash: Option<&str>,
) -> Result<DownloadReport> {
    let local = LockedMmap::open(local_path)?;
    let matches = search_bytes(&local, remote);
    let plan = plan_reconstruction(remote, &matches)?;

    tracing::debug!(
        blob = %target.blob,
        total = plan.total_size,
        reused = plan.bytes_reused(),
        to_fetch = plan.bytes_to_fetch(),
        ranges = plan.fetch_ranges.len(),
        "Reconstruction plan"
    );

    let fetched = fetch_ranges(store, target, &plan.fetch_ranges).await?;

    let report = DownloadReport {
        bytes_downloaded: plan.bytes_to_fetch(),
        bytes_reused: plan.bytes_reused(),
        range_requests: plan.fetch_ranges.len(),
    };

    let path = local_path.to_path_buf();
    let expected = expected_hash.map(str::to_string);
    tokio::task::spawn_blocking(move || write_reconstruction(&path, local, &plan, &fetched, expected.as_deref()))
        .await
        .map_err(|e| Error::storage(format!("reconstruction task failed: {}", e)))??;

    Ok(report)
}

/// Download an object in full, replacing `local_path` atomically
pub async fn download_full(
    store: &dyn ObjectStore,
    target: &BlobTarget,
    local_path: &Path,
    expected_hash: Option<&str>,
) -> Result<DownloadReport> {
    let data = store.download_full(&target.container, &target.blob).await?;
    let report = DownloadReport {
        bytes_downloaded: data.len() as u64,
        bytes_reused: 0,
        range_requests: 0,
    };

    let path = local_path.to_path_buf();
    let expected = expected_hash.map(str::to_string);
    tokio::task::spawn_blocking(move || {
        replace_atomically(&path, expected.as_deref(), |out| {
            out.write_all(&data).map_err(|e| Error::io("writing downloaded file", e))
        })
    })
    .await
    .map_err(|e| Error::storage(format!("download task failed: {}", e)))??;

    Ok(report)
}

fn write_reconstruction(
    path: &Path,
    local: LockedMmap,
    plan: &ReconstructionPlan,
    fetched: &[Bytes],
    expected_hash: Option<&str>,
) -> Result<()> {
    replace_atomically(path, expected_hash, |out| {
        for step in &plan.steps {
            let size = step.size as usize;
            let bytes = match step.source {
                BlockSource::Local { offset } => {
                    let start = offset as usize;
                    local.get(start..start + size).ok_or_else(|| {
                        Error::integrity(format!("local bytes {}+{} vanished during reconstruction", start, size))
                    })?
                }
                BlockSource::Fetched { range, offset } => {
                    let start = offset as usize;
                    fetched
                        .get(range)
                        .and_then(|data| data.get(start..start + size))
                        .ok_or_else(|| {
                            Error::integrity(format!("no fetched bytes for target offset {}", step.target_offset))
                        })?
                }
            };
            out.write_all(bytes).map_err(|e| Error::io("writing reconstructed file", e))?;
        }
        Ok(())
    })
}

/// Write a new version of `path` through a temp file in the same directory.
///
/// The content is hashed as it is written; on a hash mismatch or any error
/// the temp file is discarded and `path` keeps its old content.
fn replace_atomically<F>(path: &Path, expected_hash: Option<&str>, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| Error::io("creating parent directories", e))?;

    let tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| Error::io("creating temp file", e))?;
    let mut hasher = blake3::Hasher::new();
    {
        let mut out = HashingWriter {
            inner: BufWriter::new(tmp.as_file()),
            hasher: &mut hasher,
        };
        write(&mut out)?;
        out.inner.flush().map_err(|e| Error::io("flushing temp file", e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("syncing temp file", e))?;

    if let Some(expected) = expected_hash {
        let actual = hasher.finalize().to_hex().to_string();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::integrity(format!(
                "content hash mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            )));
        }
    }

    tmp.persist(path)
        .map_err(|e| Error::io("renaming temp file to target", e.error))?;
    Ok(())
}

/// Writer that feeds everything it writes into a BLAKE3 hasher
struct HashingWriter<'a, W: Write> {
    inner: W,
    hasher: &'a mut blake3::Hasher,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{build_from_bytes, content_hash};
    use crate::storage::MemoryStore;
    use tempfile::TempDir;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                (state >> 33) as u8
            })
            .collect()
    }

    async fn remote_store(data: &[u8]) -> (MemoryStore, BlobTarget) {
        let store = MemoryStore::with_container("c");
        let target = BlobTarget::new("c", "obj");
        store.put_object("c", "obj", Bytes::from(data.to_vec())).await.unwrap();
        (store, target)
    }

    #[test]
    fn test_plan_coalesces_unmatched_runs() {
        let remote = pseudo_random(10_000, 1);
        let mut local = remote.clone();
        // Damage blocks 2, 3 and 7
        local[2_500] ^= 1;
        local[3_500] ^= 1;
        local[7_000] ^= 1;

        let sig = build_from_bytes(&remote, 1000).unwrap();
        let plan = plan_reconstruction(&sig, &search_bytes(&local, &sig)).unwrap();

        assert_eq!(
            plan.fetch_ranges,
            vec![RemainingBytes::new(2000, 3999), RemainingBytes::new(7000, 7999)]
        );
        assert_eq!(plan.bytes_to_fetch(), 3000);
        assert_eq!(plan.bytes_reused(), 7000);
        assert_eq!(plan.steps[3].source, BlockSource::Fetched { range: 0, offset: 1000 });
        assert_eq!(plan.steps[8].source, BlockSource::Local { offset: 8000 });
    }

    #[test]
    fn test_plan_fetch_at_start_and_end() {
        let remote = pseudo_random(3_000, 2);
        let local = remote[1_000..2_000].to_vec();

        let sig = build_from_bytes(&remote, 1000).unwrap();
        let plan = plan_reconstruction(&sig, &search_bytes(&local, &sig)).unwrap();

        assert_eq!(
            plan.fetch_ranges,
            vec![RemainingBytes::new(0, 999), RemainingBytes::new(2000, 2999)]
        );
        assert_eq!(plan.steps[1].source, BlockSource::Local { offset: 0 });
    }

    #[test]
    fn test_plan_rejects_gapped_signature() {
        let mut sig = SignatureSet::new();
        let full = build_from_bytes(&pseudo_random(3_000, 3), 1000).unwrap();
        for block in full.blocks_by_offset().into_iter().filter(|b| b.block_number != 1) {
            sig.insert(block.clone());
        }

        let err = plan_reconstruction(&sig, &SignatureSearchResult::default());
        assert!(matches!(err, Err(Error::ReconstructionIntegrity { .. })));
    }

    #[tokio::test]
    async fn test_download_with_reuse_rebuilds_remote() {
        let remote = pseudo_random(20_000, 4);
        let mut local = remote.clone();
        local.truncate(15_000);
        local[4_321] ^= 0x55;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, &local).unwrap();

        let (store, target) = remote_store(&remote).await;
        let sig = build_from_bytes(&remote, 1000).unwrap();
        let report = download_with_reuse(&store, &target, &sig, &path, Some(&content_hash(&remote)))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), remote);
        assert_eq!(report.bytes_downloaded, 6_000);
        assert_eq!(report.bytes_reused, 14_000);
        assert_eq!(report.range_requests, 2);
        assert_eq!(store.bytes_downloaded(), 6_000);
    }

    #[tokio::test]
    async fn test_hash_mismatch_keeps_original() {
        let remote = pseudo_random(5_000, 5);
        let local = pseudo_random(5_000, 6);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, &local).unwrap();

        let (store, target) = remote_store(&remote).await;
        let sig = build_from_bytes(&remote, 1000).unwrap();
        let err = download_with_reuse(&store, &target, &sig, &path, Some("00")).await;

        assert!(matches!(err, Err(Error::ReconstructionIntegrity { .. })));
        assert_eq!(std::fs::read(&path).unwrap(), local);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_download_full_creates_file() {
        let remote = pseudo_random(3_333, 7);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/file.bin");

        let (store, target) = remote_store(&remote).await;
        let report = download_full(&store, &target, &path, Some(&content_hash(&remote)))
            .await
            .unwrap();

        assert_eq!(report.bytes_downloaded, 3_333);
        assert_eq!(std::fs::read(&path).unwrap(), remote);
    }
}
