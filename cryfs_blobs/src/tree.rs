//! The left-perfect k-ary block tree behind a blob.
//!
//! Geometry invariants maintained by every operation:
//!
//! - all subtrees left of the rightmost path are full to capacity;
//! - only the rightmost leaf may hold fewer than its maximum bytes;
//! - depth is uniform: every path from the root reaches a leaf at depth 0;
//! - the root's block id never changes. Growing a level copies the old
//!   root's content into a fresh block and rewrites the root in place as
//!   an inner node above it; shrinking moves the single remaining child's
//!   content back up into the root block.
//!
//! Nodes are loaded lazily per operation; parent pointers exist only as
//! the traversal stack, never in the stored representation.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};

use cryfs_core::{BlockId, BlockStoreError, BlockStoreResult};

use crate::node::{DataInnerNode, DataNode, serialize_inner};
use crate::node_store::DataNodeStore;

pub struct DataTree {
    root_id: BlockId,
    store: Arc<DataNodeStore>,
    /// Blob size in bytes; recomputed on demand by a right-spine walk and
    /// invalidated by resize.
    cached_num_bytes: Mutex<Option<u64>>,
}

impl DataTree {
    pub fn new(root_id: BlockId, store: Arc<DataNodeStore>) -> Self {
        Self {
            root_id,
            store,
            cached_num_bytes: Mutex::new(None),
        }
    }

    pub fn root_id(&self) -> BlockId {
        self.root_id
    }

    pub async fn depth(&self) -> BlockStoreResult<u8> {
        Ok(self.store.load_existing(&self.root_id).await?.depth())
    }

    /// Blob size in bytes: full leaves times leaf capacity plus the
    /// rightmost leaf's byte count.
    pub async fn num_bytes(&self) -> BlockStoreResult<u64> {
        if let Some(cached) = *self.cached_num_bytes.lock().unwrap() {
            return Ok(cached);
        }
        let (num_leaves, last_leaf_bytes) = self.right_spine().await?;
        let size = (num_leaves - 1) * self.store.layout().max_bytes_per_leaf() + last_leaf_bytes;
        *self.cached_num_bytes.lock().unwrap() = Some(size);
        Ok(size)
    }

    /// Walks the rightmost path, counting leaves left of it as full.
    async fn right_spine(&self) -> BlockStoreResult<(u64, u64)> {
        let mut node = self.store.load_existing(&self.root_id).await?;
        let mut full_leaves: u64 = 0;
        loop {
            match node {
                DataNode::Leaf(leaf) => {
                    return Ok((full_leaves + 1, u64::from(leaf.num_bytes())));
                }
                DataNode::Inner(inner) => {
                    let child_leaves = self
                        .store
                        .layout()
                        .max_leaves_per_subtree(inner.depth() - 1);
                    full_leaves += (u64::from(inner.num_children()) - 1) * child_leaves;
                    let next = inner.last_child_id();
                    node = self.store.load_existing(&next).await?;
                }
            }
        }
    }

    /// Reads up to `out.len()` bytes at `offset`; returns how many were
    /// available. Reading past the end yields a short (or empty) read.
    pub async fn try_read_bytes(&self, offset: u64, out: &mut [u8]) -> BlockStoreResult<usize> {
        let size = self.num_bytes().await?;
        if offset >= size || out.is_empty() {
            return Ok(0);
        }
        let readable = out.len().min((size - offset) as usize);
        let root = self.store.load_existing(&self.root_id).await?;
        self.read_from_subtree(root, offset, &mut out[..readable])
            .await?;
        Ok(readable)
    }

    /// Reads exactly `out.len()` bytes at `offset`; the range must be
    /// within the blob.
    pub async fn read_bytes(&self, offset: u64, out: &mut [u8]) -> BlockStoreResult<()> {
        let read = self.try_read_bytes(offset, out).await?;
        if read != out.len() {
            return Err(BlockStoreError::corrupted(
                self.root_id,
                "read range extends past the end of the blob",
            ));
        }
        Ok(())
    }

    /// Writes at `offset`, implicitly growing (zero-filled) if the write
    /// extends past the current end.
    pub async fn write_bytes(&self, offset: u64, data: &[u8]) -> BlockStoreResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = self.num_bytes().await?;
        let end = offset + data.len() as u64;
        if end > size {
            self.resize_num_bytes(end).await?;
        }
        let root = self.store.load_existing(&self.root_id).await?;
        self.write_to_subtree(root, offset, data).await
    }

    fn read_from_subtree<'a>(
        &'a self,
        node: DataNode,
        offset: u64,
        out: &'a mut [u8],
    ) -> BoxFuture<'a, BlockStoreResult<()>> {
        Box::pin(async move {
            match node {
                DataNode::Leaf(leaf) => leaf.read(offset as usize, out),
                DataNode::Inner(inner) => {
                    let bytes_per_child = self
                        .store
                        .layout()
                        .max_bytes_per_subtree(inner.depth() - 1);
                    let mut child_index = (offset / bytes_per_child) as u32;
                    let mut offset_in_child = offset % bytes_per_child;
                    let mut remaining = out;
                    while !remaining.is_empty() {
                        if child_index >= inner.num_children() {
                            return Err(BlockStoreError::corrupted(
                                inner.id(),
                                "read descends past the last child",
                            ));
                        }
                        let n = ((bytes_per_child - offset_in_child) as usize).min(remaining.len());
                        let (head, tail) = remaining.split_at_mut(n);
                        let child = self
                            .store
                            .load_existing(&inner.child_id(child_index))
                            .await?;
                        self.read_from_subtree(child, offset_in_child, head).await?;
                        remaining = tail;
                        child_index += 1;
                        offset_in_child = 0;
                    }
                    Ok(())
                }
            }
        })
    }

    fn write_to_subtree<'a>(
        &'a self,
        node: DataNode,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, BlockStoreResult<()>> {
        Box::pin(async move {
            match node {
                DataNode::Leaf(leaf) => {
                    leaf.write(offset as usize, data);
                    Ok(())
                }
                DataNode::Inner(inner) => {
                    let bytes_per_child = self
                        .store
                        .layout()
                        .max_bytes_per_subtree(inner.depth() - 1);
                    let mut child_index = (offset / bytes_per_child) as u32;
                    let mut offset_in_child = offset % bytes_per_child;
                    let mut remaining = data;
                    while !remaining.is_empty() {
                        if child_index >= inner.num_children() {
                            return Err(BlockStoreError::corrupted(
                                inner.id(),
                                "write descends past the last child",
                            ));
                        }
                        let n = ((bytes_per_child - offset_in_child) as usize).min(remaining.len());
                        let (head, tail) = remaining.split_at(n);
                        let child = self
                            .store
                            .load_existing(&inner.child_id(child_index))
                            .await?;
                        self.write_to_subtree(child, offset_in_child, head).await?;
                        remaining = tail;
                        child_index += 1;
                        offset_in_child = 0;
                    }
                    Ok(())
                }
            }
        })
    }

    /// Grows or shrinks the blob to exactly `new_size` bytes. Growth
    /// zero-fills; shrinking drops trailing leaves and collapses the root
    /// while a single child still covers the remaining size.
    pub async fn resize_num_bytes(&self, new_size: u64) -> BlockStoreResult<()> {
        let max_leaf = self.store.layout().max_bytes_per_leaf();
        let target_leaves = if new_size == 0 {
            1
        } else {
            new_size.div_ceil(max_leaf)
        };
        let (mut current_leaves, _) = self.right_spine().await?;

        if target_leaves > current_leaves {
            self.rightmost_leaf().await?.resize(max_leaf as u32);
            while current_leaves < target_leaves {
                self.add_leaf(current_leaves).await?;
                current_leaves += 1;
                if current_leaves < target_leaves {
                    self.rightmost_leaf().await?.resize(max_leaf as u32);
                }
            }
        } else {
            while current_leaves > target_leaves {
                self.remove_last_leaf().await?;
                current_leaves -= 1;
            }
            self.collapse_root().await?;
        }

        let last_leaf_bytes = new_size - (target_leaves - 1) * max_leaf;
        self.rightmost_leaf().await?.resize(last_leaf_bytes as u32);
        *self.cached_num_bytes.lock().unwrap() = Some(new_size);
        Ok(())
    }

    async fn rightmost_leaf(&self) -> BlockStoreResult<crate::node::DataLeafNode> {
        let mut node = self.store.load_existing(&self.root_id).await?;
        loop {
            match node {
                DataNode::Leaf(leaf) => return Ok(leaf),
                DataNode::Inner(inner) => {
                    let next = inner.last_child_id();
                    node = self.store.load_existing(&next).await?;
                }
            }
        }
    }

    /// Appends one empty leaf. The caller has filled the current rightmost
    /// leaf to capacity, so the left-perfect shape is preserved.
    async fn add_leaf(&self, current_leaves: u64) -> BlockStoreResult<()> {
        let layout = self.store.layout();
        let root = self.store.load_existing(&self.root_id).await?;
        let depth = root.depth();

        if current_leaves == layout.max_leaves_per_subtree(depth) {
            // The tree is full: push the root's content down into a copy
            // and turn the root block into an inner node one level up.
            let copy = self.store.create_copy_of(&root).await?;
            let new_root = serialize_inner(layout, depth + 1, &[copy.id()]);
            root.block().write_all(&new_root);
            drop(copy);

            let chain = self.create_chain(depth).await?;
            let DataNode::Inner(root_inner) =
                DataNode::parse(root.block().clone(), layout)?
            else {
                unreachable!("root was just rewritten as an inner node");
            };
            root_inner.add_child(chain);
            return Ok(());
        }

        // Collect the right spine and attach at the lowest node with room.
        let DataNode::Inner(root_inner) = root else {
            unreachable!("a non-full leaf root is covered by the growth branch");
        };
        let mut spine: Vec<DataInnerNode> = Vec::new();
        let mut node = root_inner;
        loop {
            let next_id = node.last_child_id();
            let at_bottom = node.depth() == 1;
            spine.push(node);
            if at_bottom {
                break;
            }
            node = match self.store.load_existing(&next_id).await? {
                DataNode::Inner(inner) => inner,
                DataNode::Leaf(leaf) => {
                    return Err(BlockStoreError::corrupted(
                        leaf.id(),
                        "leaf at inner-node depth",
                    ));
                }
            };
        }
        let attach = spine
            .iter()
            .rev()
            .find(|n| u64::from(n.num_children()) < layout.max_children_per_inner_node())
            .expect("a non-full tree has a right-border node with room");
        let chain = self.create_chain(attach.depth() - 1).await?;
        attach.add_child(chain);
        Ok(())
    }

    /// Creates a minimal subtree of the given depth holding one empty leaf.
    async fn create_chain(&self, depth: u8) -> BlockStoreResult<BlockId> {
        let mut id = self.store.create_new_leaf(&[]).await?.id();
        for d in 1..=depth {
            id = self.store.create_new_inner(d, &[id]).await?.id();
        }
        Ok(id)
    }

    /// Removes the rightmost leaf and any inner nodes emptied by it. The
    /// caller keeps at least one leaf in the tree.
    async fn remove_last_leaf(&self) -> BlockStoreResult<()> {
        let DataNode::Inner(root) = self.store.load_existing(&self.root_id).await? else {
            return Err(BlockStoreError::corrupted(
                self.root_id,
                "cannot remove the only leaf of a blob",
            ));
        };
        let root_empty = self.remove_last_leaf_from(&root).await?;
        debug_assert!(!root_empty, "shrinking never empties the root");
        Ok(())
    }

    fn remove_last_leaf_from<'a>(
        &'a self,
        node: &'a DataInnerNode,
    ) -> BoxFuture<'a, BlockStoreResult<bool>> {
        Box::pin(async move {
            let last_id = node.last_child_id();
            let child = self.store.load_existing(&last_id).await?;
            match child {
                DataNode::Leaf(leaf) => {
                    drop(leaf);
                    self.store.remove_by_id(&last_id).await?;
                    node.remove_last_child();
                }
                DataNode::Inner(inner_child) => {
                    let emptied = self.remove_last_leaf_from(&inner_child).await?;
                    if emptied {
                        drop(inner_child);
                        self.store.remove_by_id(&last_id).await?;
                        node.remove_last_child();
                    }
                }
            }
            Ok(node.num_children() == 0)
        })
    }

    /// While the root has a single child, moves that child's content up
    /// into the root block, reducing tree depth without changing the id.
    async fn collapse_root(&self) -> BlockStoreResult<()> {
        loop {
            let DataNode::Inner(root) = self.store.load_existing(&self.root_id).await? else {
                return Ok(());
            };
            if root.num_children() != 1 {
                return Ok(());
            }
            let child_id = root.child_id(0);
            let child = self.store.load_existing(&child_id).await?;
            let raw = child.raw_copy();
            drop(child);
            root.overwrite_with_raw(&raw);
            drop(root);
            self.store.remove_by_id(&child_id).await?;
        }
    }

    /// Flushes every node of this blob to the base store, children before
    /// parents, so a crash mid-flush never leaves a parent referencing an
    /// unwritten child.
    pub async fn flush(&self) -> BlockStoreResult<()> {
        self.flush_subtree(self.root_id).await
    }

    fn flush_subtree<'a>(&'a self, id: BlockId) -> BoxFuture<'a, BlockStoreResult<()>> {
        Box::pin(async move {
            let node = self.store.load_existing(&id).await?;
            let children: Vec<BlockId> = match &node {
                DataNode::Inner(inner) => {
                    (0..inner.num_children()).map(|i| inner.child_id(i)).collect()
                }
                DataNode::Leaf(_) => Vec::new(),
            };
            for child in children {
                self.flush_subtree(child).await?;
            }
            self.store.blocks().flush_block(node.block()).await
        })
    }

    /// Removes every node of this blob, the root last.
    pub async fn remove_all_nodes(self) -> BlockStoreResult<()> {
        self.delete_subtree(self.root_id).await
    }

    fn delete_subtree<'a>(&'a self, id: BlockId) -> BoxFuture<'a, BlockStoreResult<()>> {
        Box::pin(async move {
            let node = self.store.load_existing(&id).await?;
            let children: Vec<BlockId> = match &node {
                DataNode::Inner(inner) => {
                    (0..inner.num_children()).map(|i| inner.child_id(i)).collect()
                }
                DataNode::Leaf(_) => Vec::new(),
            };
            drop(node);
            for child in children {
                self.delete_subtree(child).await?;
            }
            self.store.remove_by_id(&id).await
        })
    }
}
