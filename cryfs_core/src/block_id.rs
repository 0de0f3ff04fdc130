//! The block identifier type (16 random bytes).

use rand::RngCore;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a [`BlockId`].
pub const BLOCK_ID_LEN: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum BlockIdError {
    #[error("invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid length: expected {BLOCK_ID_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// Identifier for a stored block.
///
/// A `BlockId` is 16 opaque random bytes. It keys every layer of the block
/// store stack and doubles as the identifier of a blob (the blob's root
/// node). The hex form is used in on-disk filenames, the binary form inside
/// block headers.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    /// Creates a fresh random id.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; BLOCK_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a `BlockId` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, BlockIdError> {
        let bytes: [u8; BLOCK_ID_LEN] = slice
            .try_into()
            .map_err(|_| BlockIdError::InvalidLength(slice.len()))?;
        Ok(Self(bytes))
    }

    /// Bytes of the id.
    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }

    /// Convert the id to its lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse an id from a hex string (either case).
    pub fn from_hex(s: &str) -> Result<Self, BlockIdError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// First few bytes as hex, for log messages.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for BlockId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8; BLOCK_ID_LEN]> for BlockId {
    fn borrow(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }
}

impl From<[u8; BLOCK_ID_LEN]> for BlockId {
    fn from(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<BlockId> for [u8; BLOCK_ID_LEN] {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

impl FromStr for BlockId {
    type Err = BlockIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
