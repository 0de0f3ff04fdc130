use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream;

use cryfs_core::{
    BlockId, BlockStore, BlockStoreResult, RemoveResult, TryCreateResult, store::BlockIdStream,
};

/// An in-memory `BlockStore` holding all blocks in a concurrent map.
///
/// Primarily used as the base store in tests; the layered stores behave
/// identically on top of it and on top of the on-disk store.
#[derive(Debug)]
pub struct InMemoryBlockStore {
    blocks: DashMap<BlockId, Bytes>,
}

impl InMemoryBlockStore {
    /// Creates a new, empty `InMemoryBlockStore`.
    pub fn new() -> Self {
        Self {
            blocks: DashMap::new(),
        }
    }
}

impl Default for InMemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BlockStore for InMemoryBlockStore {
    /// Stores `data` iff `id` is still vacant. The map entry API makes
    /// concurrent `try_create` calls for the same id race safely.
    async fn try_create(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<TryCreateResult> {
        match self.blocks.entry(*id) {
            Entry::Occupied(_) => Ok(TryCreateResult::AlreadyExists),
            Entry::Vacant(entry) => {
                entry.insert(data);
                Ok(TryCreateResult::Created)
            }
        }
    }

    async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()> {
        self.blocks.insert(*id, data);
        Ok(())
    }

    async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<Bytes>> {
        Ok(self.blocks.get(id).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        match self.blocks.remove(id) {
            Some(_) => Ok(RemoveResult::Removed),
            None => Ok(RemoveResult::NotRemovedBecauseItDoesntExist),
        }
    }

    async fn num_blocks(&self) -> BlockStoreResult<u64> {
        Ok(self.blocks.len() as u64)
    }

    /// There is no meaningful bound for an in-memory store; report the
    /// largest value so callers never think we are full.
    fn estimate_free_bytes(&self) -> BlockStoreResult<u64> {
        Ok(u64::MAX)
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        physical
    }

    async fn block_ids(&self) -> BlockStoreResult<BlockIdStream> {
        let ids: Vec<BlockStoreResult<BlockId>> =
            self.blocks.iter().map(|entry| Ok(*entry.key())).collect();
        Ok(Box::new(stream::iter(ids)))
    }
}
