//! Test utilities for `BlockStore` implementations.
//!
//! This module provides a contract test suite that can be run against any
//! `BlockStore` implementation to verify correctness.
//!
//! # Usage
//!
//! In your store crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! cryfs_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use cryfs_core::testutil::BlockStoreTests;
//!
//! #[tokio::test]
//! async fn test_my_store() {
//!     let store = MyStore::new(...);
//!     BlockStoreTests::new(&store).run_all().await.unwrap();
//! }
//! ```

use crate::block_id::BlockId;
use crate::error::BlockStoreResult;
use crate::store::{BlockStore, RemoveResult, TryCreateResult};
use bytes::Bytes;
use futures::StreamExt;
use rand::RngCore;
use std::collections::HashSet;

/// Contract test suite for `BlockStore` implementations.
pub struct BlockStoreTests<'a, S> {
    store: &'a S,
}

impl<'a, S: BlockStore> BlockStoreTests<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Run all tests.
    pub async fn run_all(&self) -> BlockStoreResult<()> {
        self.test_create_load_roundtrip().await?;
        self.test_try_create_existing_fails().await?;
        self.test_overwrite().await?;
        self.test_overwrite_creates_missing().await?;
        self.test_load_absent().await?;
        self.test_remove().await?;
        self.test_remove_absent().await?;
        self.test_empty_payload().await?;
        self.test_num_blocks().await?;
        self.test_block_ids().await?;
        self.test_created_ids_are_fresh().await?;
        Ok(())
    }

    /// `try_create` then `load` returns the exact payload.
    pub async fn test_create_load_roundtrip(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        let data = random_bytes(1024);

        let created = self.store.try_create(&id, data.clone()).await?;
        assert_eq!(TryCreateResult::Created, created, "block should be created");

        let loaded = self.store.load(&id).await?;
        assert_eq!(Some(data), loaded, "loaded payload should match stored");
        Ok(())
    }

    /// A second `try_create` for the same id does not win.
    pub async fn test_try_create_existing_fails(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        let first = random_bytes(128);
        let second = random_bytes(128);

        self.store.try_create(&id, first.clone()).await?;
        let result = self.store.try_create(&id, second).await?;
        assert_eq!(
            TryCreateResult::AlreadyExists,
            result,
            "second try_create should lose"
        );

        let loaded = self.store.load(&id).await?;
        assert_eq!(Some(first), loaded, "first payload should survive");
        Ok(())
    }

    /// `overwrite` replaces an existing payload.
    pub async fn test_overwrite(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        self.store.try_create(&id, random_bytes(256)).await?;

        let replacement = random_bytes(512);
        self.store.overwrite(&id, replacement.clone()).await?;

        let loaded = self.store.load(&id).await?;
        assert_eq!(Some(replacement), loaded, "overwrite should replace");
        Ok(())
    }

    /// `overwrite` on a missing block creates it.
    pub async fn test_overwrite_creates_missing(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        let data = random_bytes(64);
        self.store.overwrite(&id, data.clone()).await?;

        let loaded = self.store.load(&id).await?;
        assert_eq!(Some(data), loaded, "overwrite should create");
        Ok(())
    }

    /// Loading an id that was never stored returns `None`.
    pub async fn test_load_absent(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        assert_eq!(None, self.store.load(&id).await?);
        Ok(())
    }

    /// A removed block is gone.
    pub async fn test_remove(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        self.store.try_create(&id, random_bytes(32)).await?;

        let removed = self.store.remove(&id).await?;
        assert_eq!(RemoveResult::Removed, removed);
        assert_eq!(None, self.store.load(&id).await?, "block should be gone");
        Ok(())
    }

    /// Removing an absent block reports it as absent, not an error.
    pub async fn test_remove_absent(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        let removed = self.store.remove(&id).await?;
        assert_eq!(RemoveResult::NotRemovedBecauseItDoesntExist, removed);
        Ok(())
    }

    /// Zero-length payloads round-trip too.
    pub async fn test_empty_payload(&self) -> BlockStoreResult<()> {
        let id = self.store.create_block_id();
        self.store.try_create(&id, Bytes::new()).await?;
        assert_eq!(Some(Bytes::new()), self.store.load(&id).await?);
        Ok(())
    }

    /// `num_blocks` follows create/remove.
    pub async fn test_num_blocks(&self) -> BlockStoreResult<()> {
        let before = self.store.num_blocks().await?;

        let id = self.store.create_block_id();
        self.store.try_create(&id, random_bytes(16)).await?;
        assert_eq!(before + 1, self.store.num_blocks().await?);

        self.store.remove(&id).await?;
        assert_eq!(before, self.store.num_blocks().await?);
        Ok(())
    }

    /// `block_ids` yields every stored id.
    pub async fn test_block_ids(&self) -> BlockStoreResult<()> {
        let mut created = HashSet::new();
        for _ in 0..3 {
            let id = self.store.create_block_id();
            self.store.try_create(&id, random_bytes(16)).await?;
            created.insert(id);
        }

        let mut stream = self.store.block_ids().await?;
        let mut listed = HashSet::new();
        while let Some(id) = stream.next().await {
            listed.insert(id?);
        }

        for id in &created {
            assert!(listed.contains(id), "listing should contain {id}");
        }

        for id in &created {
            self.store.remove(id).await?;
        }
        Ok(())
    }

    /// `create_block_id` does not hand out ids of existing blocks.
    pub async fn test_created_ids_are_fresh(&self) -> BlockStoreResult<()> {
        let a = self.store.create_block_id();
        let b = self.store.create_block_id();
        assert_ne!(a, b, "consecutive ids should differ");
        assert_eq!(None, self.store.load(&a).await?);
        Ok(())
    }
}

/// Generate random bytes for testing.
pub fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Deterministic pseudorandom bytes derived from a seed, for tests that
/// compare data across stores or restarts.
pub fn deterministic_bytes(seed: u64, len: usize) -> Bytes {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Bytes::from(data)
}
