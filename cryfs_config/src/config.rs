//! The plaintext config record stored inside the crypto envelope.

use serde::{Deserialize, Serialize};

use cryfs_crypto::{EncryptionKey, lookup_cipher};

/// Filesystem format this version creates and accepts.
pub const FILESYSTEM_FORMAT_VERSION: &str = "0.10";

/// Default block size recorded in new configs, in bytes (physical).
pub const DEFAULT_BLOCK_SIZE_BYTES: u64 = 32 * 1024;

/// Default cipher for new filesystems.
pub const DEFAULT_CIPHER: &str = "xchacha20-poly1305";

/// 16-byte filesystem identifier, hex-encoded in the config record.
pub type FilesystemId = [u8; 16];

/// The config record. Serialized as JSON inside the encrypted envelope;
/// field names are part of the on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Hex id of the root directory blob.
    pub root_blob_id: String,
    /// Name of the cipher encrypting data blocks.
    pub cipher_name: String,
    /// Hex encryption key for data blocks.
    pub encryption_key: String,
    /// Physical size of one block file, including all layer overhead.
    pub block_size_bytes: u64,
    /// Hex 16-byte filesystem id.
    pub filesystem_id: String,
    /// Filesystem format version.
    pub version: String,
    pub created_with_version: String,
    pub last_opened_with_version: String,
    /// If set, only this client id may mount the filesystem.
    pub exclusive_client_id: Option<u32>,
    pub has_parent_pointers: bool,
    pub has_version_numbers: bool,
}

impl Config {
    /// A fresh config for a new filesystem: random key, random filesystem
    /// id, no root blob yet (set once the root dir blob is created).
    pub fn new_for_creation(cipher_name: &str, block_size_bytes: u64) -> Option<Self> {
        let cipher = lookup_cipher(cipher_name)?;
        let key = EncryptionKey::new_random(cipher.key_size);
        let mut filesystem_id = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut filesystem_id);
        Some(Self {
            root_blob_id: String::new(),
            cipher_name: cipher_name.to_string(),
            encryption_key: key.to_hex(),
            block_size_bytes,
            filesystem_id: hex::encode(filesystem_id),
            version: FILESYSTEM_FORMAT_VERSION.to_string(),
            created_with_version: FILESYSTEM_FORMAT_VERSION.to_string(),
            last_opened_with_version: FILESYSTEM_FORMAT_VERSION.to_string(),
            exclusive_client_id: None,
            has_parent_pointers: false,
            has_version_numbers: true,
        })
    }

    pub fn encryption_key(&self) -> Result<EncryptionKey, String> {
        EncryptionKey::from_hex(&self.encryption_key).map_err(|e| e.to_string())
    }

    pub fn filesystem_id(&self) -> Result<FilesystemId, String> {
        let bytes = hex::decode(&self.filesystem_id).map_err(|e| e.to_string())?;
        bytes
            .try_into()
            .map_err(|_| "filesystem id must be 16 bytes".to_string())
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("config record always serializes")
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Compares a config's format version against what this build supports.
pub fn check_format_version(version: &str) -> Result<(), crate::error::ConfigLoadError> {
    use crate::error::ConfigLoadError;
    if version == FILESYSTEM_FORMAT_VERSION {
        return Ok(());
    }
    let parse = |v: &str| -> Option<(u32, u32)> {
        let (major, minor) = v.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    };
    let current = parse(FILESYSTEM_FORMAT_VERSION).expect("own version parses");
    match parse(version) {
        Some(found) if found < current => {
            Err(ConfigLoadError::TooOldFilesystemFormat(version.to_string()))
        }
        Some(_) => Err(ConfigLoadError::TooNewFilesystemFormat(version.to_string())),
        None => Err(ConfigLoadError::InvalidFormat(format!(
            "unparseable format version {version}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let mut config = Config::new_for_creation(DEFAULT_CIPHER, 32768).unwrap();
        config.root_blob_id = "00112233445566778899aabbccddeeff".to_string();
        let restored = Config::from_json(&config.to_json()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn fresh_configs_have_distinct_ids_and_keys() {
        let a = Config::new_for_creation(DEFAULT_CIPHER, 32768).unwrap();
        let b = Config::new_for_creation(DEFAULT_CIPHER, 32768).unwrap();
        assert_ne!(a.filesystem_id, b.filesystem_id);
        assert_ne!(a.encryption_key, b.encryption_key);
    }

    #[test]
    fn unknown_cipher_cannot_be_created() {
        assert!(Config::new_for_creation("rot13", 32768).is_none());
    }

    #[test]
    fn version_check() {
        assert!(check_format_version("0.10").is_ok());
        assert!(matches!(
            check_format_version("0.9"),
            Err(crate::error::ConfigLoadError::TooOldFilesystemFormat(_))
        ));
        assert!(matches!(
            check_format_version("0.11"),
            Err(crate::error::ConfigLoadError::TooNewFilesystemFormat(_))
        ));
        assert!(matches!(
            check_format_version("1.0"),
            Err(crate::error::ConfigLoadError::TooNewFilesystemFormat(_))
        ));
    }
}
