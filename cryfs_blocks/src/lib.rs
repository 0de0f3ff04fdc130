//! The layered block store stack.
//!
//! Every layer implements the same [`cryfs_core::BlockStore`] contract and
//! wraps the layer below it:
//!
//! 1. [`integrity::IntegrityBlockStore`] — per-block versioned headers;
//!    detects rollback, replay, reassignment and deletion attacks.
//! 2. [`encrypted::EncryptedBlockStore`] — authenticated encryption of each
//!    block under the filesystem key.
//! 3. [`caching::CachingBlockStore`] — write-back cache with an age-based
//!    background sweeper and size-bound eviction.
//! 4. [`parallel_access::ParallelAccessBlockStore`] — at most one in-memory
//!    representative per block id, handed out as reference-counted
//!    [`parallel_access::BlockRef`] handles.
//!
//! Stacked bottom-up over a base store:
//!
//! ```text
//! ParallelAccessBlockStore(CachingBlockStore(EncryptedBlockStore(
//!     IntegrityBlockStore(OnDiskBlockStore))))
//! ```
//!
//! Lock order is parallel access → caching → integrity → base; no layer
//! holds its own lock across a call into the layer below.

pub mod caching;
pub mod encrypted;
pub mod integrity;
pub mod parallel_access;

pub use caching::CachingBlockStore;
pub use encrypted::EncryptedBlockStore;
pub use integrity::{IntegrityBlockStore, IntegrityConfig, known_block_versions::KnownBlockVersions};
pub use parallel_access::{BlockRef, ParallelAccessBlockStore};
