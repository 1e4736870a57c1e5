//! End-to-end upload and download through `SyncContext`

use deltablob::storage::{LocalStore, MemoryStore, ObjectStore};
use deltablob::sync::{SyncContext, CONTENT_HASH_KEY};
use deltablob::{Config, Error};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const MB: usize = 1024 * 1024;

fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed ^ 0x2545_F491_4F6C_DD1D;
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(len);
    data
}

fn create_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn read_file(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

fn config(block_size: usize) -> Config {
    Config {
        block_size,
        parallelism: 4,
        ..Default::default()
    }
}

fn memory_context(block_size: usize) -> (Arc<MemoryStore>, SyncContext) {
    let store = Arc::new(MemoryStore::with_container("images"));
    let ctx = SyncContext::new(config(block_size), store.clone());
    (store, ctx)
}

#[tokio::test]
async fn test_fresh_upload_then_append() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(MB);

    let mut data = random_data(10 * MB, 1);
    let file = create_file(dir.path(), "disk.img", &data);

    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(report.blocks_uploaded, 10);
    assert_eq!(report.bytes_uploaded, 10 * MB as u64);
    assert_eq!(report.blocks_reused, 0);
    assert_eq!(store.object_data("images", "disk.img").unwrap(), data);

    data.extend_from_slice(&random_data(1024, 2));
    fs::write(&file, &data).unwrap();
    store.reset_counters();

    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(report.bytes_uploaded, 1024);
    assert_eq!(report.blocks_uploaded, 1);
    assert_eq!(report.blocks_reused, 10);
    assert_eq!(store.put_block_calls(), 1);
    assert_eq!(store.object_data("images", "disk.img").unwrap(), data);
}

#[tokio::test]
async fn test_single_byte_change_uploads_one_block() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(MB);

    let mut data = random_data(10 * MB, 3);
    let file = create_file(dir.path(), "disk.img", &data);
    ctx.upload(&file, "images", "disk.img").await.unwrap();

    data[5 * MB + 77] = data[5 * MB + 77].wrapping_add(1);
    fs::write(&file, &data).unwrap();

    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(report.bytes_uploaded, MB as u64);
    assert_eq!(report.blocks_reused, 9);
    assert_eq!(store.object_data("images", "disk.img").unwrap(), data);
}

#[tokio::test]
async fn test_reupload_unchanged_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(256 * 1024);

    let data = random_data(3 * MB + 12_345, 4);
    let file = create_file(dir.path(), "disk.img", &data);
    ctx.upload(&file, "images", "disk.img").await.unwrap();
    store.reset_counters();

    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(report.bytes_uploaded, 0);
    assert_eq!(report.bytes_reused, data.len() as u64);
    assert_eq!(store.put_block_calls(), 0);
    assert_eq!(store.put_block_list_calls(), 1);
}

#[tokio::test]
async fn test_repeated_content_is_staged_once() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(MB);

    let block = random_data(MB, 5);
    let mut data = block.clone();
    data.extend_from_slice(&block);
    data.extend_from_slice(&random_data(MB, 6));
    let file = create_file(dir.path(), "disk.img", &data);

    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(store.put_block_calls(), 2);
    assert_eq!(report.blocks_uploaded, 2);
    assert_eq!(report.blocks_deduplicated, 1);
    assert_eq!(report.total_size, 3 * MB as u64);
    assert_eq!(store.object_data("images", "disk.img").unwrap(), data);
}

#[tokio::test]
async fn test_failed_block_leaves_blob_untouched() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(MB);

    let original = random_data(4 * MB, 7);
    let file = create_file(dir.path(), "disk.img", &original);
    ctx.upload(&file, "images", "disk.img").await.unwrap();

    let mut changed = original.clone();
    changed[MB] ^= 0xFF;
    fs::write(&file, &changed).unwrap();

    store.reset_counters();
    store.fail_put_block(true);
    let err = ctx.upload(&file, "images", "disk.img").await;
    assert!(matches!(err, Err(Error::Transport { .. })));
    assert_eq!(store.put_block_list_calls(), 0);
    assert_eq!(store.object_data("images", "disk.img").unwrap(), original);

    // The old signature no longer vouches for the blob, so the retry sends
    // everything
    store.fail_put_block(false);
    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(report.bytes_uploaded, changed.len() as u64);
    assert_eq!(store.object_data("images", "disk.img").unwrap(), changed);
}

#[tokio::test]
async fn test_download_reuses_matching_local_blocks() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(MB);

    let remote = random_data(10 * MB, 8);
    let source = create_file(dir.path(), "source.img", &remote);
    ctx.upload(&source, "images", "disk.img").await.unwrap();

    // Local copy is stale in blocks 2 and 7
    let mut local = remote.clone();
    local[2 * MB..3 * MB].copy_from_slice(&random_data(MB, 9));
    local[7 * MB..8 * MB].copy_from_slice(&random_data(MB, 10));
    let target = create_file(dir.path(), "local.img", &local);

    store.reset_counters();
    let report = ctx.download("images", "disk.img", &target).await.unwrap();

    assert_eq!(report.bytes_downloaded, 2 * MB as u64);
    assert_eq!(report.bytes_reused, 8 * MB as u64);
    assert_eq!(report.range_requests, 2);
    assert_eq!(store.range_requests(), 2);
    assert_eq!(read_file(&target), remote);
}

#[tokio::test]
async fn test_download_without_local_file() {
    let dir = TempDir::new().unwrap();
    let (_store, ctx) = memory_context(MB);

    let remote = random_data(2 * MB + 100, 11);
    let source = create_file(dir.path(), "source.img", &remote);
    ctx.upload(&source, "images", "disk.img").await.unwrap();

    let target = dir.path().join("nested").join("copy.img");
    let report = ctx.download("images", "disk.img", &target).await.unwrap();
    assert_eq!(report.bytes_downloaded, remote.len() as u64);
    assert_eq!(report.bytes_reused, 0);
    assert_eq!(read_file(&target), remote);
}

#[tokio::test]
async fn test_download_rejects_wrong_content_hash() {
    let dir = TempDir::new().unwrap();
    let (store, ctx) = memory_context(MB);

    let remote = random_data(MB + 5, 12);
    let source = create_file(dir.path(), "source.img", &remote);
    ctx.upload(&source, "images", "disk.img").await.unwrap();

    let mut metadata = store.get_object_metadata("images", "disk.img").await.unwrap();
    metadata.insert(CONTENT_HASH_KEY.to_string(), "0".repeat(64));
    store.set_object_metadata("images", "disk.img", metadata).await.unwrap();

    let target = create_file(dir.path(), "local.img", b"previous content");
    let err = ctx.download("images", "disk.img", &target).await;
    assert!(matches!(err, Err(Error::ReconstructionIntegrity { .. })));
    assert_eq!(read_file(&target), b"previous content");
}

#[tokio::test]
async fn test_block_size_change_between_versions() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_container("images"));

    let mut data = random_data(4 * MB, 13);
    let file = create_file(dir.path(), "disk.img", &data);
    SyncContext::new(config(MB), store.clone())
        .upload(&file, "images", "disk.img")
        .await
        .unwrap();

    // New blocks are cut at the smaller size, old ones are kept whole
    data[2 * MB + 10] ^= 1;
    fs::write(&file, &data).unwrap();
    let ctx = SyncContext::new(config(256 * 1024), store.clone());
    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(report.blocks_reused, 3);
    assert_eq!(report.blocks_uploaded, 4);

    let sig = ctx.fetch_signature("images", "disk.img").await.unwrap().unwrap();
    assert_eq!(sig.sizes_descending(), vec![MB as u32, 256 * 1024]);

    // A stale local copy is reconstructed from both sizes
    let stale = create_file(dir.path(), "stale.img", &random_data(4 * MB, 13));
    let report = ctx.download("images", "disk.img", &stale).await.unwrap();
    assert_eq!(report.bytes_downloaded, 256 * 1024);
    assert_eq!(read_file(&stale), data);
}

#[tokio::test]
async fn test_local_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("store");
    let store = LocalStore::new(root.clone());
    store.create_container("images").await.unwrap();
    let ctx = SyncContext::new(config(64 * 1024), Arc::new(store));

    let mut data = random_data(MB + 333, 14);
    let file = create_file(dir.path(), "disk.img", &data);
    ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert_eq!(read_file(&root.join("images").join("disk.img")), data);

    data.splice(500_000..500_000, random_data(4096, 15));
    fs::write(&file, &data).unwrap();
    let report = ctx.upload(&file, "images", "disk.img").await.unwrap();
    assert!(report.bytes_uploaded < 3 * 64 * 1024);
    assert_eq!(read_file(&root.join("images").join("disk.img")), data);

    let copy = create_file(dir.path(), "copy.img", &random_data(MB + 333, 14));
    let report = ctx.download("images", "disk.img", &copy).await.unwrap();
    assert!(report.bytes_reused > 0);
    assert_eq!(read_file(&copy), data);
}

#[tokio::test]
async fn test_local_store_missing_container() {
    let dir = TempDir::new().unwrap();
    let ctx = SyncContext::new(config(MB), Arc::new(LocalStore::new(dir.path().to_path_buf())));
    let file = create_file(dir.path(), "f.bin", b"payload");

    let err = ctx.upload(&file, "absent", "f.bin").await;
    assert!(matches!(err, Err(Error::Config { .. })));
}
