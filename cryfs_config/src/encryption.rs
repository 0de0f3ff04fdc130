//! The two-layer crypto envelope around the config record.
//!
//! Outer layout (what ends up on disk):
//!
//! ```text
//! "cryfs.config;1;scrypt" 0x00
//! kdf parameter blob length (u32 LE) || kdf parameter blob
//! outer ciphertext (tail): AES-256-GCM over the inner config, which is
//! padded to OUTER_CONFIG_SIZE bytes before encryption
//! ```
//!
//! Inner layout (inside the outer ciphertext):
//!
//! ```text
//! cipher name length (u32 LE) || cipher name (ASCII)
//! inner ciphertext (tail): the filesystem cipher over the JSON config
//! record, padded to INNER_CONFIG_SIZE bytes before encryption
//! ```
//!
//! Random padding carries a 4-byte length header so decryption can strip
//! it; padding before encryption makes the file size independent of the
//! config content. The scrypt key is 64 bytes: the first 32 are the outer
//! key, the rest the inner key.

use cryfs_crypto::cipher::BlockCipher;
use cryfs_crypto::{EncryptionKey, ScryptParams, lookup_cipher};
use rand::RngCore;

use crate::error::ConfigLoadError;

pub const HEADER: &[u8] = b"cryfs.config;1;scrypt";
pub const OLD_HEADER: &[u8] = b"cryfs.config;0;scrypt";

/// Inner plaintext is padded to this size before inner encryption.
pub const INNER_CONFIG_SIZE: usize = 900;
/// Serialized inner config is padded to this size before outer encryption.
pub const OUTER_CONFIG_SIZE: usize = 1024;

const OUTER_CIPHER: &str = "aes-256-gcm";
const OUTER_KEY_SIZE: usize = 32;
/// Outer key plus the largest inner key.
pub const DERIVED_KEY_SIZE: usize = OUTER_KEY_SIZE + cryfs_crypto::MAX_KEY_SIZE;

/// Appends random padding behind a 4-byte length header, so the result is
/// exactly `target_size` bytes.
fn add_padding(data: &[u8], target_size: usize) -> Result<Vec<u8>, ConfigLoadError> {
    if data.len() + 4 > target_size {
        return Err(ConfigLoadError::InvalidFormat(format!(
            "config record of {} bytes exceeds the padding target",
            data.len()
        )));
    }
    let mut out = vec![0u8; target_size];
    out[..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    out[4..4 + data.len()].copy_from_slice(data);
    rand::rng().fill_bytes(&mut out[4 + data.len()..]);
    Ok(out)
}

fn remove_padding(data: &[u8]) -> Result<Vec<u8>, ConfigLoadError> {
    if data.len() < 4 {
        return Err(ConfigLoadError::InvalidFormat("padding too short".into()));
    }
    let size = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
    if 4 + size > data.len() {
        return Err(ConfigLoadError::InvalidFormat("invalid padding".into()));
    }
    Ok(data[4..4 + size].to_vec())
}

/// Seals and opens config records. Holds the KDF parameters and the key
/// derived from them, so saving doesn't re-run scrypt.
pub struct ConfigEncryptor {
    kdf_params: ScryptParams,
    derived_key: EncryptionKey,
}

impl ConfigEncryptor {
    /// Derives the envelope keys for a new config file.
    pub fn generate(password: &str, kdf_params: ScryptParams) -> Result<Self, ConfigLoadError> {
        let derived_key = kdf_params
            .derive_key(password, DERIVED_KEY_SIZE)
            .map_err(|e| ConfigLoadError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            kdf_params,
            derived_key,
        })
    }

    fn outer_cipher(&self) -> BlockCipher {
        BlockCipher::new(OUTER_CIPHER, &self.derived_key.take(OUTER_KEY_SIZE))
            .expect("outer cipher is registered and the derived key is long enough")
    }

    fn inner_cipher(&self, cipher_name: &str) -> Result<BlockCipher, ConfigLoadError> {
        let spec = lookup_cipher(cipher_name)
            .ok_or_else(|| ConfigLoadError::UnsupportedCipher(cipher_name.to_string()))?;
        BlockCipher::new(spec.name, &self.derived_key.drop_prefix(OUTER_KEY_SIZE))
            .map_err(|e| ConfigLoadError::InvalidFormat(e.to_string()))
    }

    /// Seals `plaintext` (the JSON config record) into the full on-disk
    /// envelope. Output length depends only on the KDF parameter size.
    pub fn encrypt(&self, plaintext: &[u8], cipher_name: &str) -> Result<Vec<u8>, ConfigLoadError> {
        // Inner layer: filesystem cipher over the padded record.
        let inner_padded = add_padding(plaintext, INNER_CONFIG_SIZE)?;
        let inner_ciphertext = self
            .inner_cipher(cipher_name)?
            .encrypt(&inner_padded, b"")
            .map_err(|e| ConfigLoadError::InvalidFormat(e.to_string()))?;

        let mut inner_config = Vec::with_capacity(4 + cipher_name.len() + inner_ciphertext.len());
        inner_config.extend_from_slice(&(cipher_name.len() as u32).to_le_bytes());
        inner_config.extend_from_slice(cipher_name.as_bytes());
        inner_config.extend_from_slice(&inner_ciphertext);

        // Outer layer: scrypt-keyed AES-256-GCM over the padded inner config.
        let outer_padded = add_padding(&inner_config, OUTER_CONFIG_SIZE)?;
        let outer_ciphertext = self
            .outer_cipher()
            .encrypt(&outer_padded, b"")
            .map_err(|e| ConfigLoadError::InvalidFormat(e.to_string()))?;

        let kdf_blob = self.kdf_params.serialize();
        let mut out =
            Vec::with_capacity(HEADER.len() + 1 + 4 + kdf_blob.len() + outer_ciphertext.len());
        out.extend_from_slice(HEADER);
        out.push(0);
        out.extend_from_slice(&(kdf_blob.len() as u32).to_le_bytes());
        out.extend_from_slice(&kdf_blob);
        out.extend_from_slice(&outer_ciphertext);
        Ok(out)
    }

    /// Splits the on-disk envelope into KDF parameters and outer
    /// ciphertext, without needing a password yet.
    pub fn parse_outer(data: &[u8]) -> Result<(ScryptParams, &[u8]), ConfigLoadError> {
        let rest = if let Some(rest) = strip_header(data, HEADER) {
            rest
        } else if strip_header(data, OLD_HEADER).is_some() {
            // Version 0 envelopes predate this implementation.
            return Err(ConfigLoadError::TooOldFilesystemFormat("0".to_string()));
        } else {
            return Err(ConfigLoadError::InvalidFormat(
                "not a cryfs config file".into(),
            ));
        };
        if rest.len() < 4 {
            return Err(ConfigLoadError::InvalidFormat("truncated config".into()));
        }
        let kdf_len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
        if rest.len() < 4 + kdf_len {
            return Err(ConfigLoadError::InvalidFormat("truncated config".into()));
        }
        let kdf_params = ScryptParams::deserialize(&rest[4..4 + kdf_len])
            .map_err(|e| ConfigLoadError::InvalidFormat(e.to_string()))?;
        Ok((kdf_params, &rest[4 + kdf_len..]))
    }

    /// Opens the envelope. A failing outer decryption means the password
    /// is wrong; anything below that is a corrupt file.
    pub fn decrypt(&self, outer_ciphertext: &[u8]) -> Result<(Vec<u8>, String), ConfigLoadError> {
        let outer_padded = self
            .outer_cipher()
            .decrypt(outer_ciphertext, b"")
            .map_err(|_| ConfigLoadError::WrongPassword)?;
        let inner_config = remove_padding(&outer_padded)?;

        if inner_config.len() < 4 {
            return Err(ConfigLoadError::InvalidFormat("truncated inner config".into()));
        }
        let name_len = u32::from_le_bytes(inner_config[..4].try_into().unwrap()) as usize;
        if inner_config.len() < 4 + name_len {
            return Err(ConfigLoadError::InvalidFormat("truncated inner config".into()));
        }
        let cipher_name = std::str::from_utf8(&inner_config[4..4 + name_len])
            .map_err(|_| ConfigLoadError::InvalidFormat("cipher name is not UTF-8".into()))?
            .to_string();
        let inner_ciphertext = &inner_config[4 + name_len..];

        let inner_padded = self
            .inner_cipher(&cipher_name)?
            .decrypt(inner_ciphertext, b"")
            .map_err(|_| ConfigLoadError::InvalidFormat("inner decryption failed".into()))?;
        let plaintext = remove_padding(&inner_padded)?;
        Ok((plaintext, cipher_name))
    }
}

fn strip_header<'a>(data: &'a [u8], header: &[u8]) -> Option<&'a [u8]> {
    let rest = data.strip_prefix(header)?;
    rest.strip_prefix(&[0u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor(password: &str) -> ConfigEncryptor {
        ConfigEncryptor::generate(password, ScryptParams::generate_for_tests()).unwrap()
    }

    #[test]
    fn envelope_roundtrip() {
        let enc = encryptor("password");
        let sealed = enc.encrypt(b"{\"some\":\"record\"}", "xchacha20-poly1305").unwrap();

        let (kdf_params, outer) = ConfigEncryptor::parse_outer(&sealed).unwrap();
        let enc2 = ConfigEncryptor::generate("password", kdf_params).unwrap();
        let (plaintext, cipher_name) = enc2.decrypt(outer).unwrap();
        assert_eq!(b"{\"some\":\"record\"}", plaintext.as_slice());
        assert_eq!("xchacha20-poly1305", cipher_name);
    }

    #[test]
    fn wrong_password_is_detected() {
        let enc = encryptor("hunter2");
        let sealed = enc.encrypt(b"record", "aes-256-gcm").unwrap();

        let (kdf_params, outer) = ConfigEncryptor::parse_outer(&sealed).unwrap();
        let wrong = ConfigEncryptor::generate("hunter3", kdf_params).unwrap();
        assert!(matches!(
            wrong.decrypt(outer),
            Err(ConfigLoadError::WrongPassword)
        ));
    }

    #[test]
    fn output_size_is_independent_of_content() {
        let enc = encryptor("password");
        let small = enc.encrypt(b"{}", "aes-256-gcm").unwrap();
        let large = enc
            .encrypt(&vec![b'x'; 500], "xchacha20-poly1305")
            .unwrap();
        assert_eq!(small.len(), large.len());
    }

    #[test]
    fn rejects_version_0_envelopes() {
        let mut data = OLD_HEADER.to_vec();
        data.push(0);
        data.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            ConfigEncryptor::parse_outer(&data),
            Err(ConfigLoadError::TooOldFilesystemFormat(_))
        ));
    }

    #[test]
    fn rejects_foreign_files() {
        assert!(matches!(
            ConfigEncryptor::parse_outer(b"definitely not a config"),
            Err(ConfigLoadError::InvalidFormat(_))
        ));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let enc = encryptor("password");
        assert!(enc.encrypt(&vec![0u8; 2000], "aes-256-gcm").is_err());
    }
}
