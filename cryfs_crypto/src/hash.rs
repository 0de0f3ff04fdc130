//! Salted hashing, used to recognize a changed encryption key in local
//! state without storing the key itself.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub const SALT_SIZE: usize = 16;
pub const DIGEST_SIZE: usize = 32;

/// A salted SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaltedHash {
    pub salt: Vec<u8>,
    pub digest: Vec<u8>,
}

impl SaltedHash {
    /// Hashes `data` under a fresh random salt.
    pub fn generate(data: &[u8]) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut salt);
        let digest = hash_with_salt(data, &salt);
        Self { salt, digest }
    }

    /// Whether `data` hashes to this digest under this hash's salt.
    pub fn matches(&self, data: &[u8]) -> bool {
        hash_with_salt(data, &self.salt) == self.digest
    }
}

pub fn hash_with_salt(data: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data);
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_same_data() {
        let hash = SaltedHash::generate(b"key material");
        assert!(hash.matches(b"key material"));
    }

    #[test]
    fn rejects_different_data() {
        let hash = SaltedHash::generate(b"key material");
        assert!(!hash.matches(b"other key material"));
    }

    #[test]
    fn salts_are_fresh() {
        let a = SaltedHash::generate(b"data");
        let b = SaltedHash::generate(b"data");
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.digest, b.digest);
    }
}
