//! Error types shared across the block store stack.

use crate::block_id::BlockId;

pub type BlockStoreResult<T> = std::result::Result<T, BlockStoreError>;

/// Errors surfaced by block store layers.
#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    /// The block does not exist in the store.
    #[error("block {0} not found")]
    NotFound(BlockId),

    /// Decryption failed, the block is truncated, or a header is malformed.
    /// The ciphertext on disk does not decode to a valid block.
    #[error("block {id} is corrupted: {reason}")]
    CorruptedBlock { id: BlockId, reason: String },

    /// The integrity layer detected a rollback, replay, reassignment or
    /// deletion attack.
    #[error(transparent)]
    IntegrityViolation(#[from] IntegrityViolationError),

    /// The underlying filesystem has no space left.
    #[error("no space left in the underlying store")]
    OutOfSpace,

    /// I/O against the base store or local state failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BlockStoreError {
    pub fn corrupted(id: BlockId, reason: impl Into<String>) -> Self {
        Self::CorruptedBlock {
            id,
            reason: reason.into(),
        }
    }
}

/// The concrete attack classes the integrity layer can detect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityViolationError {
    #[error(
        "block {id} was written by client {client_id} with version {seen}, but we already saw \
         version {expected} from that client. Did an attacker roll back or replay the block?"
    )]
    RollBack {
        id: BlockId,
        client_id: u32,
        expected: u64,
        seen: u64,
    },

    #[error(
        "block {id} contains a header for block {claimed}. Did an attacker try to reassign a \
         block to a different id?"
    )]
    IdMismatch { id: BlockId, claimed: BlockId },

    #[error("block {id} should exist but is missing. Did an attacker delete it?")]
    MissingBlock { id: BlockId },

    #[error("block {id} was deleted but reappeared. Did an attacker reintroduce an old block?")]
    DeletedBlockReappeared { id: BlockId },

    #[error(
        "a previous run detected an integrity violation. Refusing to mount. Delete the \
         integrity state file to acknowledge and mount anyway."
    )]
    PreviousRun,
}
