//! The blob facade over the node tree.

use std::sync::Arc;

use cryfs_blocks::ParallelAccessBlockStore;
use cryfs_core::{BlockId, BlockStoreResult, RemoveResult};

use crate::node_store::{BlockSizeTooSmall, DataNodeStore};
use crate::tree::DataTree;

/// Creates and opens blobs over the block store stack.
#[derive(Debug, Clone)]
pub struct BlobStore {
    node_store: Arc<DataNodeStore>,
}

impl BlobStore {
    pub fn new(
        blocks: Arc<ParallelAccessBlockStore>,
        physical_block_size: u64,
    ) -> Result<Self, BlockSizeTooSmall> {
        Ok(Self {
            node_store: Arc::new(DataNodeStore::new(blocks, physical_block_size)?),
        })
    }

    /// Allocates a new empty blob (a single empty leaf). The leaf's block
    /// id is the blob's id.
    pub async fn create(&self) -> BlockStoreResult<Blob> {
        let leaf = self.node_store.create_new_leaf(&[]).await?;
        let id = leaf.id();
        drop(leaf);
        Ok(Blob {
            tree: DataTree::new(id, self.node_store.clone()),
        })
    }

    /// Opens an existing blob; only the root node is touched, the rest of
    /// the tree loads lazily.
    pub async fn open(&self, id: &BlockId) -> BlockStoreResult<Option<Blob>> {
        match self.node_store.load(id).await? {
            Some(_root) => Ok(Some(Blob {
                tree: DataTree::new(*id, self.node_store.clone()),
            })),
            None => Ok(None),
        }
    }

    /// Removes a blob and all its nodes by id.
    pub async fn remove_by_id(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        match self.open(id).await? {
            Some(blob) => {
                blob.remove().await?;
                Ok(RemoveResult::Removed)
            }
            None => Ok(RemoveResult::NotRemovedBecauseItDoesntExist),
        }
    }

    /// Number of tree nodes (blocks) currently stored.
    pub async fn num_nodes(&self) -> BlockStoreResult<u64> {
        self.node_store.num_nodes().await
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> BlockStoreResult<u64> {
        self.node_store.estimate_space_for_num_nodes_left()
    }

    /// Payload bytes a single leaf can hold; the filesystem layer uses
    /// this for size estimates.
    pub fn virtual_block_size_bytes(&self) -> u64 {
        self.node_store.layout().max_bytes_per_leaf()
    }
}

/// A variable-length byte array backed by a block tree.
pub struct Blob {
    tree: DataTree,
}

impl Blob {
    pub fn id(&self) -> BlockId {
        self.tree.root_id()
    }

    pub async fn size(&self) -> BlockStoreResult<u64> {
        self.tree.num_bytes().await
    }

    pub async fn resize(&self, new_size: u64) -> BlockStoreResult<()> {
        self.tree.resize_num_bytes(new_size).await
    }

    /// Reads exactly `out.len()` bytes; errors if the range leaves the blob.
    pub async fn read(&self, offset: u64, out: &mut [u8]) -> BlockStoreResult<()> {
        self.tree.read_bytes(offset, out).await
    }

    /// Reads up to `out.len()` bytes, short at the end of the blob.
    pub async fn try_read(&self, offset: u64, out: &mut [u8]) -> BlockStoreResult<usize> {
        self.tree.try_read_bytes(offset, out).await
    }

    pub async fn read_all(&self) -> BlockStoreResult<Vec<u8>> {
        let size = self.size().await?;
        let mut out = vec![0u8; size as usize];
        self.tree.read_bytes(0, &mut out).await?;
        Ok(out)
    }

    /// Writes at `offset`, growing the blob (zero-filled) as needed.
    pub async fn write(&self, offset: u64, data: &[u8]) -> BlockStoreResult<()> {
        self.tree.write_bytes(offset, data).await
    }

    /// Writes every dirty node of this blob through to the base store.
    pub async fn flush(&self) -> BlockStoreResult<()> {
        self.tree.flush().await
    }

    /// Deletes the blob and all its nodes.
    pub async fn remove(self) -> BlockStoreResult<()> {
        self.tree.remove_all_nodes().await
    }

    /// Tree depth; 0 means a single leaf.
    pub async fn depth(&self) -> BlockStoreResult<u8> {
        self.tree.depth().await
    }
}
