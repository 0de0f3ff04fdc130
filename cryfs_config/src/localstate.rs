//! Per-basedir local state: client id and encryption key hash.
//!
//! Local state lives outside the basedir (an attacker who can tamper with
//! the ciphertext must not be able to tamper with what we remember about
//! it), keyed by filesystem id:
//! `$XDG_DATA_HOME/cryfs/<filesystem-id>/`, overridable via
//! `CRYFS_LOCAL_STATE_DIR`.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use cryfs_crypto::hash::SaltedHash;

use crate::config::FilesystemId;
use crate::error::ErrorCode;

/// Client id 0 is reserved by the integrity layer to mark deleted blocks.
const RESERVED_CLIENT_ID: u32 = 0;

pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const INTEGRITY_DATA_FILE_NAME: &str = "integritydata";

#[derive(Debug, thiserror::Error)]
pub enum LocalStateError {
    #[error(
        "the filesystem encryption key differs from the last time we loaded this filesystem. \
         Did an attacker replace the file system?"
    )]
    EncryptionKeyChanged,
    #[error(
        "the filesystem id in this basedir changed since we last loaded it. Did an attacker \
         replace the file system?"
    )]
    FilesystemIdChanged,
    #[error("invalid local state file: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl LocalStateError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::EncryptionKeyChanged => ErrorCode::EncryptionKeyChanged,
            Self::FilesystemIdChanged => ErrorCode::FilesystemIdChanged,
            Self::InvalidFormat(_) | Self::Io(_) => ErrorCode::UnspecifiedError,
        }
    }
}

/// Root of all local state directories.
#[derive(Debug, Clone)]
pub struct LocalStateDir {
    base: PathBuf,
}

impl LocalStateDir {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `CRYFS_LOCAL_STATE_DIR` if set, else `$XDG_DATA_HOME/cryfs`, else
    /// `~/.local/share/cryfs`.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("CRYFS_LOCAL_STATE_DIR") {
            return Self::new(dir);
        }
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return Self::new(PathBuf::from(data_home).join("cryfs"));
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".local/share/cryfs"))
    }

    /// State directory for one filesystem, keyed by its id.
    pub fn for_filesystem_id(&self, filesystem_id: &FilesystemId) -> PathBuf {
        self.base.join(hex::encode(filesystem_id))
    }

    fn basedir_metadata_path(&self) -> PathBuf {
        self.base.join("basedirs.json")
    }
}

/// Remembers which filesystem id lives in which basedir, so swapping a
/// whole basedir for a different filesystem doesn't go unnoticed.
pub struct BasedirMetadata;

impl BasedirMetadata {
    /// Verifies (or records, on first contact) the filesystem id for
    /// `basedir`. A changed id means the whole filesystem was replaced.
    pub fn check_and_update(
        state: &LocalStateDir,
        basedir: &Path,
        filesystem_id: &FilesystemId,
        allow_replaced_filesystem: bool,
    ) -> Result<(), LocalStateError> {
        let path = state.basedir_metadata_path();
        let mut map: std::collections::BTreeMap<String, String> = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| LocalStateError::InvalidFormat(e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Default::default(),
            Err(e) => return Err(e.into()),
        };

        let key = basedir.to_string_lossy().to_string();
        let id_hex = hex::encode(filesystem_id);
        if let Some(recorded) = map.get(&key) {
            if *recorded != id_hex && !allow_replaced_filesystem {
                return Err(LocalStateError::FilesystemIdChanged);
            }
        }
        map.insert(key, id_hex);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&map)
            .map_err(|e| LocalStateError::InvalidFormat(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}

/// What this machine remembers about a filesystem: its own client id and a
/// salted hash of the encryption key, to notice a swapped-out filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStateMetadata {
    my_client_id: u32,
    encryption_key_hash: SaltedHash,
}

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    #[serde(rename = "myClientId")]
    my_client_id: u32,
    #[serde(rename = "encryptionKey")]
    encryption_key: KeyHashFile,
}

#[derive(Serialize, Deserialize)]
struct KeyHashFile {
    salt: String,
    hash: String,
}

impl LocalStateMetadata {
    pub fn my_client_id(&self) -> u32 {
        self.my_client_id
    }

    /// Loads the metadata for a state dir, verifying the key hash, or
    /// generates fresh metadata on first contact.
    pub fn load_or_generate(
        state_dir: &Path,
        encryption_key: &[u8],
        allow_replaced_filesystem: bool,
    ) -> Result<Self, LocalStateError> {
        let metadata_file = state_dir.join(METADATA_FILE_NAME);
        match Self::load(&metadata_file)? {
            Some(loaded) => {
                if !allow_replaced_filesystem
                    && !loaded.encryption_key_hash.matches(encryption_key)
                {
                    return Err(LocalStateError::EncryptionKeyChanged);
                }
                Ok(loaded)
            }
            None => Self::generate(&metadata_file, encryption_key),
        }
    }

    fn load(path: &Path) -> Result<Option<Self>, LocalStateError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed: MetadataFile = serde_json::from_slice(&data)
            .map_err(|e| LocalStateError::InvalidFormat(e.to_string()))?;
        let salt = hex::decode(&parsed.encryption_key.salt)
            .map_err(|e| LocalStateError::InvalidFormat(e.to_string()))?;
        let digest = hex::decode(&parsed.encryption_key.hash)
            .map_err(|e| LocalStateError::InvalidFormat(e.to_string()))?;
        Ok(Some(Self {
            my_client_id: parsed.my_client_id,
            encryption_key_hash: SaltedHash { salt, digest },
        }))
    }

    fn generate(path: &Path, encryption_key: &[u8]) -> Result<Self, LocalStateError> {
        let metadata = Self {
            my_client_id: generate_client_id(),
            encryption_key_hash: SaltedHash::generate(encryption_key),
        };
        metadata.save(path)?;
        Ok(metadata)
    }

    fn save(&self, path: &Path) -> Result<(), LocalStateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = MetadataFile {
            my_client_id: self.my_client_id,
            encryption_key: KeyHashFile {
                salt: hex::encode(&self.encryption_key_hash.salt),
                hash: hex::encode(&self.encryption_key_hash.digest),
            },
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| LocalStateError::InvalidFormat(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn generate_client_id() -> u32 {
    loop {
        let id: u32 = rand::random();
        if id != RESERVED_CLIENT_ID {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let first =
            LocalStateMetadata::load_or_generate(dir.path(), b"the key", false).unwrap();
        let second =
            LocalStateMetadata::load_or_generate(dir.path(), b"the key", false).unwrap();
        assert_eq!(first, second);
        assert_ne!(RESERVED_CLIENT_ID, first.my_client_id());
    }

    #[test]
    fn detects_changed_encryption_key() {
        let dir = tempfile::tempdir().unwrap();
        LocalStateMetadata::load_or_generate(dir.path(), b"the key", false).unwrap();
        assert!(matches!(
            LocalStateMetadata::load_or_generate(dir.path(), b"another key", false),
            Err(LocalStateError::EncryptionKeyChanged)
        ));
    }

    #[test]
    fn allows_changed_key_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let first = LocalStateMetadata::load_or_generate(dir.path(), b"the key", false).unwrap();
        let second =
            LocalStateMetadata::load_or_generate(dir.path(), b"another key", true).unwrap();
        assert_eq!(first.my_client_id(), second.my_client_id());
    }

    #[test]
    fn different_state_dirs_get_different_client_ids() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = LocalStateMetadata::load_or_generate(a.path(), b"key", false).unwrap();
        let second = LocalStateMetadata::load_or_generate(b.path(), b"key", false).unwrap();
        // Random 32-bit ids; a collision here is vanishingly unlikely.
        assert_ne!(first.my_client_id(), second.my_client_id());
    }

    #[test]
    fn state_dir_is_keyed_by_filesystem_id() {
        let state = LocalStateDir::new("/tmp/state");
        let id_a: FilesystemId = [1; 16];
        let id_b: FilesystemId = [2; 16];
        assert_ne!(state.for_filesystem_id(&id_a), state.for_filesystem_id(&id_b));
        assert!(
            state
                .for_filesystem_id(&id_a)
                .to_string_lossy()
                .contains(&hex::encode(id_a))
        );
    }

    #[test]
    fn basedir_metadata_detects_swapped_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalStateDir::new(dir.path());
        let basedir = Path::new("/some/basedir");

        BasedirMetadata::check_and_update(&state, basedir, &[1; 16], false).unwrap();
        BasedirMetadata::check_and_update(&state, basedir, &[1; 16], false).unwrap();
        assert!(matches!(
            BasedirMetadata::check_and_update(&state, basedir, &[2; 16], false),
            Err(LocalStateError::FilesystemIdChanged)
        ));
        BasedirMetadata::check_and_update(&state, basedir, &[2; 16], true).unwrap();
    }
}
