//! Typed views over a node block: leaf or inner node.
//!
//! A view owns a [`BlockRef`] handle and interprets its payload in place;
//! mutations go straight into the shared in-memory block and mark it dirty.

use cryfs_blocks::BlockRef;
use cryfs_core::{BlockId, BlockStoreError, BlockStoreResult, block_id::BLOCK_ID_LEN};

use crate::layout::{NODE_FORMAT_VERSION, NODE_HEADER_SIZE, NodeLayout};

pub enum DataNode {
    Leaf(DataLeafNode),
    Inner(DataInnerNode),
}

impl DataNode {
    /// Interprets a loaded block as a tree node.
    pub fn parse(block: BlockRef, layout: NodeLayout) -> BlockStoreResult<Self> {
        let id = block.id();
        let (format, depth, size) = block.with_data(|data| {
            if data.len() != layout.block_size_bytes() as usize {
                return Err(BlockStoreError::corrupted(
                    id,
                    format!("node block has size {}, expected {}", data.len(),
                        layout.block_size_bytes()),
                ));
            }
            let format = u16::from_le_bytes(data[0..2].try_into().unwrap());
            let depth = data[3];
            let size = u32::from_le_bytes(data[4..8].try_into().unwrap());
            Ok((format, depth, size))
        })?;
        if format != NODE_FORMAT_VERSION {
            return Err(BlockStoreError::corrupted(
                id,
                format!("unknown node format version {format}"),
            ));
        }
        if depth == 0 {
            if u64::from(size) > layout.max_bytes_per_leaf() {
                return Err(BlockStoreError::corrupted(id, "leaf larger than capacity"));
            }
            Ok(Self::Leaf(DataLeafNode { block, layout }))
        } else {
            if size == 0 || u64::from(size) > layout.max_children_per_inner_node() {
                return Err(BlockStoreError::corrupted(
                    id,
                    "inner node with invalid child count",
                ));
            }
            Ok(Self::Inner(DataInnerNode { block, layout }))
        }
    }

    pub fn id(&self) -> BlockId {
        match self {
            Self::Leaf(leaf) => leaf.id(),
            Self::Inner(inner) => inner.id(),
        }
    }

    pub fn depth(&self) -> u8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Inner(inner) => inner.depth(),
        }
    }

    pub(crate) fn block(&self) -> &BlockRef {
        match self {
            Self::Leaf(leaf) => &leaf.block,
            Self::Inner(inner) => &inner.block,
        }
    }

    /// Raw copy of the node's block payload, header included.
    pub(crate) fn raw_copy(&self) -> Vec<u8> {
        self.block().with_data(|data| data.to_vec())
    }
}

/// Serializes a leaf node into a full-size block payload.
pub(crate) fn serialize_leaf(layout: NodeLayout, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() as u64 <= layout.max_bytes_per_leaf());
    let mut block = vec![0u8; layout.block_size_bytes() as usize];
    write_header(&mut block, 0, payload.len() as u32);
    block[NODE_HEADER_SIZE..NODE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    block
}

/// Serializes an inner node into a full-size block payload.
pub(crate) fn serialize_inner(layout: NodeLayout, depth: u8, children: &[BlockId]) -> Vec<u8> {
    debug_assert!(depth > 0);
    debug_assert!(!children.is_empty());
    debug_assert!(children.len() as u64 <= layout.max_children_per_inner_node());
    let mut block = vec![0u8; layout.block_size_bytes() as usize];
    write_header(&mut block, depth, children.len() as u32);
    for (i, child) in children.iter().enumerate() {
        let offset = NODE_HEADER_SIZE + i * BLOCK_ID_LEN;
        block[offset..offset + BLOCK_ID_LEN].copy_from_slice(child.as_bytes());
    }
    block
}

fn write_header(block: &mut [u8], depth: u8, size: u32) {
    block[0..2].copy_from_slice(&NODE_FORMAT_VERSION.to_le_bytes());
    block[2] = 0;
    block[3] = depth;
    block[4..8].copy_from_slice(&size.to_le_bytes());
}

pub struct DataLeafNode {
    block: BlockRef,
    layout: NodeLayout,
}

impl DataLeafNode {
    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn num_bytes(&self) -> u32 {
        self.block
            .with_data(|data| u32::from_le_bytes(data[4..8].try_into().unwrap()))
    }

    pub fn max_bytes(&self) -> u64 {
        self.layout.max_bytes_per_leaf()
    }

    /// Sets the leaf's byte count. Grown regions read as zero; shrunk
    /// regions are wiped so stale plaintext doesn't linger in the block.
    pub fn resize(&self, new_num_bytes: u32) {
        debug_assert!(u64::from(new_num_bytes) <= self.max_bytes());
        self.block.update(|data| {
            let old = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
            let new = new_num_bytes as usize;
            if new < old {
                data[NODE_HEADER_SIZE + new..NODE_HEADER_SIZE + old].fill(0);
            }
            data[4..8].copy_from_slice(&new_num_bytes.to_le_bytes());
        });
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> BlockStoreResult<()> {
        let id = self.id();
        self.block.with_data(|data| {
            let size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
            if offset + out.len() > size {
                return Err(BlockStoreError::corrupted(id, "read beyond leaf size"));
            }
            out.copy_from_slice(&data[NODE_HEADER_SIZE + offset..NODE_HEADER_SIZE + offset + out.len()]);
            Ok(())
        })
    }

    /// Writes within the leaf's capacity, growing its byte count if the
    /// write extends past the current end.
    pub fn write(&self, offset: usize, source: &[u8]) {
        debug_assert!((offset + source.len()) as u64 <= self.max_bytes());
        self.block.update(|data| {
            let size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
            let end = offset + source.len();
            data[NODE_HEADER_SIZE + offset..NODE_HEADER_SIZE + end].copy_from_slice(source);
            if end > size {
                data[4..8].copy_from_slice(&(end as u32).to_le_bytes());
            }
        });
    }
}

pub struct DataInnerNode {
    block: BlockRef,
    layout: NodeLayout,
}

impl DataInnerNode {
    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn depth(&self) -> u8 {
        self.block.with_data(|data| data[3])
    }

    pub fn num_children(&self) -> u32 {
        self.block
            .with_data(|data| u32::from_le_bytes(data[4..8].try_into().unwrap()))
    }

    pub fn max_children(&self) -> u64 {
        self.layout.max_children_per_inner_node()
    }

    pub fn child_id(&self, index: u32) -> BlockId {
        debug_assert!(index < self.num_children());
        self.block.with_data(|data| {
            let offset = NODE_HEADER_SIZE + index as usize * BLOCK_ID_LEN;
            BlockId::from_slice(&data[offset..offset + BLOCK_ID_LEN]).unwrap()
        })
    }

    pub fn last_child_id(&self) -> BlockId {
        self.child_id(self.num_children() - 1)
    }

    pub fn add_child(&self, child: BlockId) {
        self.block.update(|data| {
            let count = u32::from_le_bytes(data[4..8].try_into().unwrap());
            debug_assert!(u64::from(count) < self.layout.max_children_per_inner_node());
            let offset = NODE_HEADER_SIZE + count as usize * BLOCK_ID_LEN;
            data[offset..offset + BLOCK_ID_LEN].copy_from_slice(child.as_bytes());
            data[4..8].copy_from_slice(&(count + 1).to_le_bytes());
        });
    }

    pub fn remove_last_child(&self) {
        self.block.update(|data| {
            let count = u32::from_le_bytes(data[4..8].try_into().unwrap());
            debug_assert!(count > 0);
            let offset = NODE_HEADER_SIZE + (count - 1) as usize * BLOCK_ID_LEN;
            data[offset..offset + BLOCK_ID_LEN].fill(0);
            data[4..8].copy_from_slice(&(count - 1).to_le_bytes());
        });
    }

    /// Replaces this node's content with another node's raw block payload.
    /// Used when the tree shrinks in depth and the single child moves up
    /// into the root block.
    pub(crate) fn overwrite_with_raw(&self, raw: &[u8]) {
        self.block.update(|data| {
            data.clear();
            data.extend_from_slice(raw);
        });
    }

    pub(crate) fn block(&self) -> &BlockRef {
        &self.block
    }
}
