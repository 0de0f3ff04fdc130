//! scrypt key derivation for the config envelope.

use rand::RngCore;

use crate::key::EncryptionKey;

#[derive(Debug, thiserror::Error)]
pub enum KdfError {
    #[error("invalid scrypt parameters: {0}")]
    InvalidParameters(String),
    #[error("scrypt parameter blob is malformed")]
    MalformedParameterBlob,
}

/// scrypt cost parameters plus the salt, as stored (serialized) in the
/// outer config.
///
/// The serialized form is `salt_len(u32 LE) || salt || n(u64 LE) ||
/// r(u32 LE) || p(u32 LE)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScryptParams {
    salt: Vec<u8>,
    log_n: u8,
    r: u32,
    p: u32,
}

const SALT_SIZE: usize = 32;

impl ScryptParams {
    /// Hardened default settings (N = 2^20, r = 4, p = 8) with a fresh salt.
    pub fn generate_default() -> Self {
        Self::generate(20, 4, 8)
    }

    /// Weak settings for tests; not suitable for protecting real data.
    pub fn generate_for_tests() -> Self {
        Self::generate(10, 1, 1)
    }

    fn generate(log_n: u8, r: u32, p: u32) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut salt);
        Self { salt, log_n, r, p }
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn n(&self) -> u64 {
        1u64 << self.log_n
    }

    pub fn r(&self) -> u32 {
        self.r
    }

    pub fn p(&self) -> u32 {
        self.p
    }

    /// Derives `out_len` key bytes from `password` under these parameters.
    pub fn derive_key(&self, password: &str, out_len: usize) -> Result<EncryptionKey, KdfError> {
        let params = scrypt::Params::new(self.log_n, self.r, self.p, out_len)
            .map_err(|e| KdfError::InvalidParameters(e.to_string()))?;
        let mut out = vec![0u8; out_len];
        scrypt::scrypt(password.as_bytes(), &self.salt, &params, &mut out)
            .map_err(|e| KdfError::InvalidParameters(e.to_string()))?;
        Ok(EncryptionKey::from_bytes(&out))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.salt.len() + 16);
        out.extend_from_slice(&(self.salt.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.n().to_le_bytes());
        out.extend_from_slice(&self.r.to_le_bytes());
        out.extend_from_slice(&self.p.to_le_bytes());
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, KdfError> {
        if data.len() < 4 {
            return Err(KdfError::MalformedParameterBlob);
        }
        let salt_len = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        if data.len() != 4 + salt_len + 8 + 4 + 4 {
            return Err(KdfError::MalformedParameterBlob);
        }
        let salt = data[4..4 + salt_len].to_vec();
        let rest = &data[4 + salt_len..];
        let n = u64::from_le_bytes(rest[..8].try_into().unwrap());
        let r = u32::from_le_bytes(rest[8..12].try_into().unwrap());
        let p = u32::from_le_bytes(rest[12..16].try_into().unwrap());
        if !n.is_power_of_two() || n < 2 {
            return Err(KdfError::InvalidParameters(format!(
                "N = {n} is not a power of two"
            )));
        }
        Ok(Self {
            salt,
            log_n: n.trailing_zeros() as u8,
            r,
            p,
        })
    }
}
