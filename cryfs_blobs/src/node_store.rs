//! Creates, loads and removes tree nodes over the block store stack.

use std::sync::Arc;

use bytes::Bytes;
use cryfs_blocks::ParallelAccessBlockStore;
use cryfs_core::{BlockId, BlockStoreError, BlockStoreResult, RemoveResult};

use crate::layout::NodeLayout;
use crate::node::{DataInnerNode, DataLeafNode, DataNode, serialize_inner, serialize_leaf};

#[derive(Debug, thiserror::Error)]
#[error("block size {0} is too small to hold tree nodes")]
pub struct BlockSizeTooSmall(pub u64);

#[derive(Debug)]
pub struct DataNodeStore {
    blocks: Arc<ParallelAccessBlockStore>,
    layout: NodeLayout,
}

impl DataNodeStore {
    /// `physical_block_size` is the on-disk block size from the config;
    /// the usable node size is what is left after every layer of the stack
    /// took its per-block overhead.
    pub fn new(
        blocks: Arc<ParallelAccessBlockStore>,
        physical_block_size: u64,
    ) -> Result<Self, BlockSizeTooSmall> {
        let usable = blocks.block_size_from_physical(physical_block_size);
        let layout = NodeLayout::new(usable).ok_or(BlockSizeTooSmall(usable))?;
        Ok(Self { blocks, layout })
    }

    pub fn layout(&self) -> NodeLayout {
        self.layout
    }

    pub async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<DataNode>> {
        match self.blocks.load(id).await? {
            Some(block) => Ok(Some(DataNode::parse(block, self.layout)?)),
            None => Ok(None),
        }
    }

    /// Loads a node that must exist; absence means the tree references a
    /// block that is gone.
    pub async fn load_existing(&self, id: &BlockId) -> BlockStoreResult<DataNode> {
        self.load(id)
            .await?
            .ok_or(BlockStoreError::NotFound(*id))
    }

    pub async fn create_new_leaf(&self, payload: &[u8]) -> BlockStoreResult<DataLeafNode> {
        let block = serialize_leaf(self.layout, payload);
        let node = self.create_raw(block).await?;
        match node {
            DataNode::Leaf(leaf) => Ok(leaf),
            DataNode::Inner(_) => unreachable!("serialized a leaf"),
        }
    }

    pub async fn create_new_inner(
        &self,
        depth: u8,
        children: &[BlockId],
    ) -> BlockStoreResult<DataInnerNode> {
        let block = serialize_inner(self.layout, depth, children);
        let node = self.create_raw(block).await?;
        match node {
            DataNode::Inner(inner) => Ok(inner),
            DataNode::Leaf(_) => unreachable!("serialized an inner node"),
        }
    }

    /// Copies a node into a fresh block, e.g. when the old root moves down
    /// a level while its block id stays the blob's id.
    pub async fn create_copy_of(&self, node: &DataNode) -> BlockStoreResult<DataNode> {
        self.create_raw(node.raw_copy()).await
    }

    async fn create_raw(&self, block_payload: Vec<u8>) -> BlockStoreResult<DataNode> {
        let block = self.blocks.create(Bytes::from(block_payload)).await?;
        DataNode::parse(block, self.layout)
    }

    pub async fn remove_by_id(&self, id: &BlockId) -> BlockStoreResult<()> {
        match self.blocks.remove(id).await? {
            RemoveResult::Removed => Ok(()),
            RemoveResult::NotRemovedBecauseItDoesntExist => Err(BlockStoreError::NotFound(*id)),
        }
    }

    pub async fn num_nodes(&self) -> BlockStoreResult<u64> {
        self.blocks.num_blocks().await
    }

    pub fn estimate_space_for_num_nodes_left(&self) -> BlockStoreResult<u64> {
        Ok(self.blocks.estimate_free_bytes()? / self.layout.block_size_bytes().max(1))
    }

    pub(crate) fn blocks(&self) -> &ParallelAccessBlockStore {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryfs_blocks::CachingBlockStore;
    use cryfs_store_memory::InMemoryBlockStore;

    // k = 4, 64 bytes per leaf
    const BLOCK_SIZE: u64 = 8 + 4 * 16;

    fn node_store() -> DataNodeStore {
        let base = Arc::new(InMemoryBlockStore::new());
        let cache = Arc::new(CachingBlockStore::new(base, 100));
        let blocks = Arc::new(ParallelAccessBlockStore::new(cache));
        DataNodeStore::new(blocks, BLOCK_SIZE).unwrap()
    }

    #[tokio::test]
    async fn leaf_roundtrip() {
        let store = node_store();
        let leaf = store.create_new_leaf(b"payload").await.unwrap();
        let id = leaf.id();
        assert_eq!(7, leaf.num_bytes());
        drop(leaf);

        let DataNode::Leaf(loaded) = store.load_existing(&id).await.unwrap() else {
            panic!("expected a leaf");
        };
        let mut out = [0u8; 7];
        loaded.read(0, &mut out).unwrap();
        assert_eq!(b"payload", &out);
    }

    #[tokio::test]
    async fn inner_node_roundtrip() {
        let store = node_store();
        let a = store.create_new_leaf(&[]).await.unwrap().id();
        let b = store.create_new_leaf(&[]).await.unwrap().id();
        let inner = store.create_new_inner(1, &[a, b]).await.unwrap();
        let id = inner.id();
        drop(inner);

        let DataNode::Inner(loaded) = store.load_existing(&id).await.unwrap() else {
            panic!("expected an inner node");
        };
        assert_eq!(1, loaded.depth());
        assert_eq!(2, loaded.num_children());
        assert_eq!(a, loaded.child_id(0));
        assert_eq!(b, loaded.child_id(1));
        assert_eq!(b, loaded.last_child_id());
    }

    #[tokio::test]
    async fn add_and_remove_children() {
        let store = node_store();
        let a = store.create_new_leaf(&[]).await.unwrap().id();
        let b = store.create_new_leaf(&[]).await.unwrap().id();
        let inner = store.create_new_inner(1, &[a]).await.unwrap();

        inner.add_child(b);
        assert_eq!(2, inner.num_children());
        assert_eq!(b, inner.last_child_id());

        inner.remove_last_child();
        assert_eq!(1, inner.num_children());
        assert_eq!(a, inner.last_child_id());
    }

    #[tokio::test]
    async fn copies_preserve_content_under_a_new_id() {
        let store = node_store();
        let leaf = store.create_new_leaf(b"content").await.unwrap();
        let original_id = leaf.id();

        let copy = store.create_copy_of(&DataNode::Leaf(leaf)).await.unwrap();
        assert_ne!(original_id, copy.id());
        let DataNode::Leaf(copy) = copy else {
            panic!("copy of a leaf is a leaf");
        };
        let mut out = [0u8; 7];
        copy.read(0, &mut out).unwrap();
        assert_eq!(b"content", &out);
    }

    #[tokio::test]
    async fn leaf_resize_zero_fills_and_wipes() {
        let store = node_store();
        let leaf = store.create_new_leaf(b"abcdef").await.unwrap();
        leaf.resize(3);
        leaf.resize(6);
        let mut out = [0u8; 6];
        leaf.read(0, &mut out).unwrap();
        assert_eq!(b"abc\0\0\0", &out);
    }

    #[tokio::test]
    async fn remove_frees_the_block() {
        let store = node_store();
        let id = store.create_new_leaf(&[]).await.unwrap().id();
        assert_eq!(1, store.num_nodes().await.unwrap());

        store.remove_by_id(&id).await.unwrap();
        assert_eq!(0, store.num_nodes().await.unwrap());
        assert!(store.load(&id).await.unwrap().is_none());
        assert!(store.remove_by_id(&id).await.is_err());
    }

    #[tokio::test]
    async fn rejects_blocks_with_wrong_size() {
        let store = node_store();
        let leaf = store.create_new_leaf(&[]).await.unwrap();
        let id = leaf.id();
        drop(leaf);
        store
            .blocks()
            .overwrite(&id, bytes::Bytes::from_static(&[0u8; 10]))
            .await
            .unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(cryfs_core::BlockStoreError::CorruptedBlock { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_depth_and_counts() {
        let store = node_store();
        let leaf = store.create_new_leaf(&[]).await.unwrap();
        let id = leaf.id();
        drop(leaf);

        // An inner node claiming zero children is invalid.
        let mut raw = vec![0u8; BLOCK_SIZE as usize];
        raw[3] = 1; // depth
        store
            .blocks()
            .overwrite(&id, bytes::Bytes::from(raw))
            .await
            .unwrap();
        assert!(matches!(
            store.load(&id).await,
            Err(cryfs_core::BlockStoreError::CorruptedBlock { .. })
        ));
    }

    #[test]
    fn rejects_too_small_blocks() {
        let base = Arc::new(InMemoryBlockStore::new());
        // Constructing the cache needs a runtime for its sweeper.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let cache = Arc::new(CachingBlockStore::new(base, 100));
        let blocks = Arc::new(ParallelAccessBlockStore::new(cache));
        assert!(DataNodeStore::new(blocks, 16).is_err());
    }
}
