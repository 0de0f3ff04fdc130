//! The block cipher registry.
//!
//! Each supported cipher is a variant of [`BlockCipher`], constructed from a
//! cipher name and a key. The static [`ALL_CIPHERS`] table is the registry;
//! config handling looks ciphers up by name and instantiates them with the
//! key material from the config file.
//!
//! Ciphertext framing is `iv || ciphertext` with the AEAD tag appended to
//! the ciphertext. The legacy CFB variants are unauthenticated stream
//! ciphers kept for old filesystems; [`CipherSpec::warns_about_integrity`]
//! marks them so mounting can surface a warning.

use aes::cipher::consts::U12;
use aes::cipher::{AsyncStreamCipher, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use aes_gcm::AesGcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::generic_array::typenum::Unsigned;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;

use crate::key::EncryptionKey;

type Twofish256Gcm = AesGcm<twofish::Twofish, U12>;
type Serpent256Gcm = AesGcm<serpent::Serpent, U12>;
type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;
type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

/// Errors that can occur during cipher operations.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("unknown cipher: {0}")]
    UnknownCipher(String),
    #[error("invalid key length for {cipher}: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        cipher: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("ciphertext too short: expected at least {0} bytes")]
    DataTooShort(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
}

/// Static description of a registered cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSpec {
    pub name: &'static str,
    pub key_size: usize,
    pub iv_size: usize,
    pub auth_tag_size: usize,
    /// True for unauthenticated legacy modes; mounting logs a warning.
    pub warns_about_integrity: bool,
}

impl CipherSpec {
    /// Per-block ciphertext overhead added by this cipher.
    pub fn ciphertext_overhead(&self) -> usize {
        self.iv_size + self.auth_tag_size
    }
}

/// The cipher registry, keyed by name.
pub const ALL_CIPHERS: &[CipherSpec] = &[
    CipherSpec {
        name: "xchacha20-poly1305",
        key_size: 32,
        iv_size: 24,
        auth_tag_size: 16,
        warns_about_integrity: false,
    },
    CipherSpec {
        name: "aes-256-gcm",
        key_size: 32,
        iv_size: 12,
        auth_tag_size: 16,
        warns_about_integrity: false,
    },
    CipherSpec {
        name: "aes-128-gcm",
        key_size: 16,
        iv_size: 12,
        auth_tag_size: 16,
        warns_about_integrity: false,
    },
    CipherSpec {
        name: "twofish-256-gcm",
        key_size: 32,
        iv_size: 12,
        auth_tag_size: 16,
        warns_about_integrity: false,
    },
    CipherSpec {
        name: "serpent-256-gcm",
        key_size: 32,
        iv_size: 12,
        auth_tag_size: 16,
        warns_about_integrity: false,
    },
    CipherSpec {
        name: "aes-256-cfb",
        key_size: 32,
        iv_size: 16,
        auth_tag_size: 0,
        warns_about_integrity: true,
    },
    CipherSpec {
        name: "aes-128-cfb",
        key_size: 16,
        iv_size: 16,
        auth_tag_size: 0,
        warns_about_integrity: true,
    },
];

/// Looks a cipher up by name.
pub fn lookup_cipher(name: &str) -> Option<&'static CipherSpec> {
    ALL_CIPHERS.iter().find(|spec| spec.name == name)
}

/// Names of all registered ciphers, in registry order.
pub fn supported_cipher_names() -> impl Iterator<Item = &'static str> {
    ALL_CIPHERS.iter().map(|spec| spec.name)
}

/// A cipher instantiated with its key.
pub enum BlockCipher {
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
    Aes256Gcm(Box<aes_gcm::Aes256Gcm>),
    Aes128Gcm(Box<aes_gcm::Aes128Gcm>),
    Twofish256Gcm(Box<Twofish256Gcm>),
    Serpent256Gcm(Box<Serpent256Gcm>),
    Aes256Cfb(EncryptionKey),
    Aes128Cfb(EncryptionKey),
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockCipher({})", self.spec().name)
    }
}

impl BlockCipher {
    /// Instantiates the registered cipher `name` with `key`.
    pub fn new(name: &str, key: &EncryptionKey) -> Result<Self, CipherError> {
        let spec = lookup_cipher(name).ok_or_else(|| CipherError::UnknownCipher(name.into()))?;
        if key.len() < spec.key_size {
            return Err(CipherError::InvalidKeyLength {
                cipher: spec.name,
                expected: spec.key_size,
                actual: key.len(),
            });
        }
        // Derived keys may be longer than needed; use the leading bytes.
        let key_bytes = &key.as_bytes()[..spec.key_size];
        Ok(match spec.name {
            "xchacha20-poly1305" => Self::XChaCha20Poly1305(Box::new(XChaCha20Poly1305::new(
                GenericArray::from_slice(key_bytes),
            ))),
            "aes-256-gcm" => Self::Aes256Gcm(Box::new(aes_gcm::Aes256Gcm::new(
                GenericArray::from_slice(key_bytes),
            ))),
            "aes-128-gcm" => Self::Aes128Gcm(Box::new(aes_gcm::Aes128Gcm::new(
                GenericArray::from_slice(key_bytes),
            ))),
            "twofish-256-gcm" => Self::Twofish256Gcm(Box::new(Twofish256Gcm::new(
                GenericArray::from_slice(key_bytes),
            ))),
            "serpent-256-gcm" => Self::Serpent256Gcm(Box::new(Serpent256Gcm::new(
                GenericArray::from_slice(key_bytes),
            ))),
            "aes-256-cfb" => Self::Aes256Cfb(EncryptionKey::from_bytes(key_bytes)),
            "aes-128-cfb" => Self::Aes128Cfb(EncryptionKey::from_bytes(key_bytes)),
            _ => unreachable!("registry entry without constructor"),
        })
    }

    pub fn spec(&self) -> &'static CipherSpec {
        let name = match self {
            Self::XChaCha20Poly1305(_) => "xchacha20-poly1305",
            Self::Aes256Gcm(_) => "aes-256-gcm",
            Self::Aes128Gcm(_) => "aes-128-gcm",
            Self::Twofish256Gcm(_) => "twofish-256-gcm",
            Self::Serpent256Gcm(_) => "serpent-256-gcm",
            Self::Aes256Cfb(_) => "aes-256-cfb",
            Self::Aes128Cfb(_) => "aes-128-cfb",
        };
        lookup_cipher(name).expect("cipher variants are always registered")
    }

    /// Encrypts `plaintext`, binding `aad` for authenticated modes.
    ///
    /// Returns `iv || ciphertext` with a fresh random IV per call.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self {
            Self::XChaCha20Poly1305(c) => aead_encrypt(c.as_ref(), plaintext, aad),
            Self::Aes256Gcm(c) => aead_encrypt(c.as_ref(), plaintext, aad),
            Self::Aes128Gcm(c) => aead_encrypt(c.as_ref(), plaintext, aad),
            Self::Twofish256Gcm(c) => aead_encrypt(c.as_ref(), plaintext, aad),
            Self::Serpent256Gcm(c) => aead_encrypt(c.as_ref(), plaintext, aad),
            Self::Aes256Cfb(key) => {
                cfb_encrypt::<Aes256CfbEnc>(key, self.spec().iv_size, plaintext)
            }
            Self::Aes128Cfb(key) => {
                cfb_encrypt::<Aes128CfbEnc>(key, self.spec().iv_size, plaintext)
            }
        }
    }

    /// Decrypts `iv || ciphertext` produced by [`Self::encrypt`].
    pub fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self {
            Self::XChaCha20Poly1305(c) => aead_decrypt(c.as_ref(), data, aad),
            Self::Aes256Gcm(c) => aead_decrypt(c.as_ref(), data, aad),
            Self::Aes128Gcm(c) => aead_decrypt(c.as_ref(), data, aad),
            Self::Twofish256Gcm(c) => aead_decrypt(c.as_ref(), data, aad),
            Self::Serpent256Gcm(c) => aead_decrypt(c.as_ref(), data, aad),
            Self::Aes256Cfb(key) => cfb_decrypt::<Aes256CfbDec>(key, self.spec().iv_size, data),
            Self::Aes128Cfb(key) => cfb_decrypt::<Aes128CfbDec>(key, self.spec().iv_size, data),
        }
    }
}

fn aead_encrypt<A>(cipher: &A, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError>
where
    A: Aead + AeadCore,
{
    let iv_size = A::NonceSize::to_usize();
    let mut result = vec![0u8; iv_size];
    rand::rng().fill_bytes(&mut result);
    let ciphertext = cipher
        .encrypt(
            GenericArray::from_slice(&result),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CipherError::EncryptionFailed)?;
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn aead_decrypt<A>(cipher: &A, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError>
where
    A: Aead + AeadCore,
{
    let iv_size = A::NonceSize::to_usize();
    let tag_size = A::TagSize::to_usize();
    if data.len() < iv_size + tag_size {
        return Err(CipherError::DataTooShort(iv_size + tag_size));
    }
    let (iv, ciphertext) = data.split_at(iv_size);
    cipher
        .decrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CipherError::DecryptionFailed)
}

fn cfb_encrypt<E>(key: &EncryptionKey, iv_size: usize, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>
where
    E: KeyIvInit + AsyncStreamCipher + BlockEncryptMut,
{
    let mut result = vec![0u8; iv_size + plaintext.len()];
    rand::rng().fill_bytes(&mut result[..iv_size]);
    result[iv_size..].copy_from_slice(plaintext);
    let (iv, buffer) = result.split_at_mut(iv_size);
    E::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CipherError::EncryptionFailed)?
        .encrypt(buffer);
    Ok(result)
}

fn cfb_decrypt<D>(key: &EncryptionKey, iv_size: usize, data: &[u8]) -> Result<Vec<u8>, CipherError>
where
    D: KeyIvInit + AsyncStreamCipher + BlockDecryptMut,
{
    if data.len() < iv_size {
        return Err(CipherError::DataTooShort(iv_size));
    }
    let (iv, ciphertext) = data.split_at(iv_size);
    let mut buffer = ciphertext.to_vec();
    D::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CipherError::DecryptionFailed)?
        .decrypt(&mut buffer);
    Ok(buffer)
}
