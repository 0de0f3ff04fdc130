//! Core cryfs types and traits.
//!
//! This crate defines the shared types and traits used by all cryfs crates.
//!
//! ## Wire-stable types
//!
//! - Block identifiers (`block_id::BlockId`) — 16 random bytes, hex in
//!   filenames, binary in block headers.
//!
//! These appear in persistent on-disk formats; changes to them are format
//! changes.
//!
//! ## Abstractions
//!
//! - The `BlockStore` trait: the uniform async contract every layer of the
//!   block store stack implements, from the on-disk base store up to the
//!   caching layer.
//! - Error types shared across the stack (`BlockStoreError`,
//!   `IntegrityViolationError`).
//!
//! The `testutil` feature exposes a reusable contract test suite that can be
//! run against any `BlockStore` implementation.

pub mod block_id;
pub mod error;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use block_id::BlockId;
pub use error::{BlockStoreError, BlockStoreResult, IntegrityViolationError};
pub use store::{BlockStore, RemoveResult, TryCreateResult};
