//! Variable-length blobs over the block store stack.
//!
//! A blob is a byte array of arbitrary length stored as a balanced,
//! left-perfect k-ary tree of fixed-size blocks:
//!
//! - every tree node occupies exactly one block;
//! - leaves hold payload bytes, inner nodes hold child block ids;
//! - only the rightmost path of the tree may contain non-full nodes;
//! - the root node's block id *is* the blob's id and never changes, even
//!   when the tree grows or shrinks in depth.
//!
//! ## Layers
//! 1. `layout` – node geometry (header, branching factor, leaf capacity).
//! 2. `node`   – typed views over a block: leaf or inner node.
//! 3. `node_store` – creates/loads/removes nodes over the block stack.
//! 4. `tree`   – the left-perfect tree: random I/O, resize, traversal.
//! 5. `store`  – the `BlobStore`/`Blob` facade the filesystem uses.

pub mod layout;
pub mod node;
pub mod node_store;
pub mod store;
pub mod tree;

pub use layout::NodeLayout;
pub use store::{Blob, BlobStore};
