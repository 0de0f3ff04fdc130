//! The uniform async block store contract.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::block_id::BlockId;
use crate::error::BlockStoreResult;

/// Stream of all block ids in a store; order is unspecified.
pub type BlockIdStream = Box<dyn Stream<Item = BlockStoreResult<BlockId>> + Send + Unpin + 'static>;

/// Outcome of [`BlockStore::try_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryCreateResult {
    Created,
    AlreadyExists,
}

/// Outcome of [`BlockStore::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveResult {
    Removed,
    NotRemovedBecauseItDoesntExist,
}

/// A store of fixed-size blocks addressed by [`BlockId`].
///
/// Every layer of the block store stack implements this same contract: the
/// on-disk and in-memory base stores, the integrity layer, the encryption
/// layer and the caching layer. Layers wrap a store of the same shape and
/// translate payloads on the way through.
///
/// Payload bytes round-trip exactly: whatever `try_create` or `overwrite`
/// stored, `load` returns, until a later `overwrite` or `remove`.
#[async_trait]
pub trait BlockStore: std::fmt::Debug + Send + Sync + 'static {
    /// Returns a fresh random id, not yet bound to any block.
    fn create_block_id(&self) -> BlockId {
        BlockId::new_random()
    }

    /// Writes `data` iff no block with `id` exists yet. Exactly one of
    /// several concurrent `try_create` calls for the same id wins.
    async fn try_create(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<TryCreateResult>;

    /// Writes `data` unconditionally, creating the block if necessary.
    async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()>;

    /// Returns the exact payload previously stored, or `None` if no block
    /// with this id exists.
    async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<Bytes>>;

    /// Removes the block. Must succeed even while no handle to it is held.
    async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult>;

    /// Number of blocks currently stored.
    async fn num_blocks(&self) -> BlockStoreResult<u64>;

    /// Estimate of how many more payload bytes this store can hold.
    fn estimate_free_bytes(&self) -> BlockStoreResult<u64>;

    /// Usable payload size for a block whose physical (on-disk) size is
    /// `physical`. Each layer subtracts its own per-block overhead and
    /// delegates down.
    fn block_size_from_physical(&self, physical: u64) -> u64;

    /// Iterate over all block ids; order is unspecified.
    async fn block_ids(&self) -> BlockStoreResult<BlockIdStream>;

    /// Flush buffered state to the layer below. No-op for unbuffered stores.
    async fn flush(&self) -> BlockStoreResult<()> {
        Ok(())
    }
}
