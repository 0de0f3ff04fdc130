//! Key material handling.

use rand::RngCore;
use std::fmt;
use zeroize::Zeroize;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid hex string: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A symmetric encryption key.
///
/// The backing memory is zeroized on drop and never shows up in `Debug`
/// output. Keys are sliceable: the config envelope derives one long key via
/// scrypt and splits it into an outer and an inner part.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    pub fn new_random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        Ok(Self(hex::decode(s)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first `n` bytes as their own key.
    pub fn take(&self, n: usize) -> Self {
        Self(self.0[..n].to_vec())
    }

    /// Everything after the first `n` bytes as its own key.
    pub fn drop_prefix(&self, n: usize) -> Self {
        Self(self.0[n..].to_vec())
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = EncryptionKey::new_random(32);
        assert_eq!(key, EncryptionKey::from_hex(&key.to_hex()).unwrap());
    }

    #[test]
    fn take_and_drop_partition_the_key() {
        let key = EncryptionKey::from_bytes(&[1, 2, 3, 4, 5]);
        assert_eq!(&[1, 2], key.take(2).as_bytes());
        assert_eq!(&[3, 4, 5], key.drop_prefix(2).as_bytes());
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let key = EncryptionKey::from_bytes(&[0xaa; 32]);
        let debug = format!("{key:?}");
        assert!(!debug.contains("aa"));
    }
}
