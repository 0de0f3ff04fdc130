//! Blob behavior over the block stack: random I/O, resize semantics, tree
//! shape, and persistence across a cache teardown.

use std::sync::Arc;

use cryfs_blobs::BlobStore;
use cryfs_blocks::{CachingBlockStore, ParallelAccessBlockStore};
use cryfs_core::BlockStore;
use cryfs_core::testutil::deterministic_bytes;
use cryfs_store_memory::InMemoryBlockStore;

/// Small blocks (k = 4, 64 bytes per leaf) keep multi-level trees cheap.
const SMALL_BLOCK: u64 = 8 + 4 * 16;

fn blob_store_over(base: Arc<InMemoryBlockStore>, block_size: u64) -> BlobStore {
    let cache = Arc::new(CachingBlockStore::new(base, 200));
    let blocks = Arc::new(ParallelAccessBlockStore::new(cache));
    BlobStore::new(blocks, block_size).unwrap()
}

fn small_blob_store() -> (Arc<InMemoryBlockStore>, BlobStore) {
    let base = Arc::new(InMemoryBlockStore::new());
    (base.clone(), blob_store_over(base, SMALL_BLOCK))
}

#[tokio::test]
async fn new_blob_is_empty_single_leaf() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    assert_eq!(0, blob.size().await.unwrap());
    assert_eq!(0, blob.depth().await.unwrap());
}

#[tokio::test]
async fn roundtrip_within_one_leaf() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    blob.write(0, b"hello blob").await.unwrap();

    assert_eq!(10, blob.size().await.unwrap());
    let mut out = [0u8; 10];
    blob.read(0, &mut out).await.unwrap();
    assert_eq!(b"hello blob", &out);
}

#[tokio::test]
async fn roundtrip_across_many_leaves() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    let data = deterministic_bytes(42, 1000);
    blob.write(0, &data).await.unwrap();

    assert_eq!(1000, blob.size().await.unwrap());
    assert!(blob.depth().await.unwrap() >= 2, "1000 bytes over 64-byte leaves needs depth 2");
    assert_eq!(data.as_ref(), blob.read_all().await.unwrap());
}

#[tokio::test]
async fn unaligned_reads_and_writes() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    let data = deterministic_bytes(7, 500);
    blob.write(0, &data).await.unwrap();

    // Overwrite a range crossing leaf boundaries.
    blob.write(60, b"XXXXXXXXXX").await.unwrap();

    let mut out = [0u8; 20];
    blob.read(55, &mut out).await.unwrap();
    assert_eq!(&data[55..60], &out[..5]);
    assert_eq!(b"XXXXXXXXXX", &out[5..15]);
    assert_eq!(&data[70..75], &out[15..]);
}

#[tokio::test]
async fn resize_sets_size_and_zero_fills() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    for size in [0u64, 1, 63, 64, 65, 200, 1000, 77] {
        blob.resize(size).await.unwrap();
        assert_eq!(size, blob.size().await.unwrap(), "after resize({size})");
    }
}

#[tokio::test]
async fn truncate_then_grow_zero_fills_the_tail() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    blob.write(0, &vec![0xabu8; 200]).await.unwrap();

    blob.resize(50).await.unwrap();
    blob.resize(500).await.unwrap();

    let content = blob.read_all().await.unwrap();
    assert_eq!(500, content.len());
    assert!(content[..50].iter().all(|&b| b == 0xab), "kept bytes intact");
    assert!(content[50..].iter().all(|&b| b == 0), "grown region reads zero");
}

#[tokio::test]
async fn write_past_end_grows_and_zero_fills_the_gap() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    blob.write(0, b"head").await.unwrap();
    blob.write(300, b"tail").await.unwrap();

    assert_eq!(304, blob.size().await.unwrap());
    let content = blob.read_all().await.unwrap();
    assert_eq!(b"head", &content[..4]);
    assert!(content[4..300].iter().all(|&b| b == 0));
    assert_eq!(b"tail", &content[300..]);
}

#[tokio::test]
async fn read_past_end_is_a_short_read() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    blob.write(0, b"0123456789").await.unwrap();

    let mut out = [0xffu8; 20];
    let read = blob.try_read(5, &mut out).await.unwrap();
    assert_eq!(5, read);
    assert_eq!(b"56789", &out[..5]);

    assert_eq!(0, blob.try_read(10, &mut out).await.unwrap());
    assert_eq!(0, blob.try_read(100, &mut out).await.unwrap());
}

#[tokio::test]
async fn blob_id_survives_depth_changes() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    let id = blob.id();

    blob.resize(5000).await.unwrap();
    assert!(blob.depth().await.unwrap() >= 3);
    assert_eq!(id, blob.id());

    // Reopen by the same id and shrink back to a single leaf.
    drop(blob);
    let blob = store.open(&id).await.unwrap().unwrap();
    assert_eq!(5000, blob.size().await.unwrap());
    blob.resize(0).await.unwrap();
    assert_eq!(0, blob.depth().await.unwrap());
    assert_eq!(0, blob.size().await.unwrap());
    assert_eq!(id, blob.id());
}

#[tokio::test]
async fn shrink_preserves_leading_content() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    let data = deterministic_bytes(3, 3000);
    blob.write(0, &data).await.unwrap();

    blob.resize(150).await.unwrap();
    let content = blob.read_all().await.unwrap();
    assert_eq!(&data[..150], content.as_slice());
}

#[tokio::test]
async fn remove_frees_every_node() {
    let (_base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    blob.resize(2000).await.unwrap();
    assert!(store.num_nodes().await.unwrap() > 30);

    blob.remove().await.unwrap();
    assert_eq!(0, store.num_nodes().await.unwrap());
}

#[tokio::test]
async fn open_unknown_blob_is_none() {
    let (_base, store) = small_blob_store();
    let id = cryfs_core::BlockId::new_random();
    assert!(store.open(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn flushed_blob_is_readable_through_a_fresh_cache() {
    let (base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    let id = blob.id();
    let data = deterministic_bytes(99, 700);
    blob.write(0, &data).await.unwrap();
    blob.flush().await.unwrap();
    drop(blob);
    drop(store);

    // A new stack over the same base store simulates a remount.
    let store = blob_store_over(base, SMALL_BLOCK);
    let blob = store.open(&id).await.unwrap().unwrap();
    assert_eq!(700, blob.size().await.unwrap());
    assert_eq!(data.as_ref(), blob.read_all().await.unwrap());
}

#[tokio::test]
async fn num_nodes_matches_block_count() {
    let (base, store) = small_blob_store();
    let blob = store.create().await.unwrap();
    blob.resize(640).await.unwrap(); // 10 leaves with 64-byte leaves
    blob.flush().await.unwrap();

    let nodes = store.num_nodes().await.unwrap();
    assert_eq!(nodes, base.num_blocks().await.unwrap());
    assert!(nodes >= 11, "10 leaves plus at least one inner node");
}

/// Scenario: a blob crossing the 4 GiB boundary on 32 KiB blocks.
#[tokio::test]
#[ignore = "allocates more than 4 GiB of in-memory blocks"]
async fn big_blob_crossing_4_gib() {
    let base = Arc::new(InMemoryBlockStore::new());
    let store = blob_store_over(base, 32 * 1024);
    let blob = store.create().await.unwrap();

    let big = 4 * 1024 * 1024 * 1024u64 + 1024 * 1024;
    blob.resize(big).await.unwrap();
    assert_eq!(big, blob.size().await.unwrap());
    assert!(blob.depth().await.unwrap() >= 3);

    let pattern = deterministic_bytes(0xC0FFEE, 1024 * 1024);
    let offset = 4 * 1024 * 1024 * 1024u64;
    blob.write(offset, &pattern).await.unwrap();

    let mut out = vec![0u8; pattern.len()];
    blob.read(offset, &mut out).await.unwrap();
    assert_eq!(pattern.as_ref(), out.as_slice());
}
