//! Loading, creating and saving the config file on disk.

use std::io::Write;
use std::path::{Path, PathBuf};

use cryfs_crypto::ScryptParams;
use tracing::warn;

use crate::config::{Config, FILESYSTEM_FORMAT_VERSION, check_format_version};
use crate::encryption::ConfigEncryptor;
use crate::error::ConfigLoadError;

/// A config record bound to its on-disk file and envelope keys.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    config: Config,
    encryptor: ConfigEncryptor,
}

impl ConfigFile {
    /// Seals a fresh config and writes it to `path`.
    pub fn create(
        path: impl Into<PathBuf>,
        config: Config,
        password: &str,
        kdf_params: ScryptParams,
    ) -> Result<Self, ConfigLoadError> {
        let encryptor = ConfigEncryptor::generate(password, kdf_params)?;
        let file = Self {
            path: path.into(),
            config,
            encryptor,
        };
        file.save()?;
        Ok(file)
    }

    /// Loads and decrypts the config at `path`, verifies the format
    /// version, and records this version as the last one to open it.
    pub fn load(path: impl Into<PathBuf>, password: &str) -> Result<Self, ConfigLoadError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigLoadError::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let (kdf_params, outer_ciphertext) = ConfigEncryptor::parse_outer(&data)?;
        let encryptor = ConfigEncryptor::generate(password, kdf_params)?;
        let (plaintext, envelope_cipher) = encryptor.decrypt(outer_ciphertext)?;

        let config = Config::from_json(&plaintext)
            .map_err(|e| ConfigLoadError::InvalidFormat(e.to_string()))?;
        if config.cipher_name != envelope_cipher {
            return Err(ConfigLoadError::InvalidFormat(format!(
                "envelope cipher {envelope_cipher} disagrees with config cipher {}",
                config.cipher_name
            )));
        }
        check_format_version(&config.version)?;

        let mut file = Self {
            path,
            config,
            encryptor,
        };
        file.config.last_opened_with_version = FILESYSTEM_FORMAT_VERSION.to_string();
        if let Err(e) = file.save() {
            // A read-only basedir shouldn't prevent mounting.
            warn!("could not update last_opened_with_version: {e}");
        }
        Ok(file)
    }

    /// Writes the sealed config to a temp file next to the target and
    /// renames it into place.
    pub fn save(&self) -> Result<(), ConfigLoadError> {
        let sealed = self
            .encryptor
            .encrypt(&self.config.to_json(), &self.config.cipher_name)?;
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&sealed)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
