//! Cryptographic primitives for cryfs.
//!
//! Provides the block cipher registry (AEAD and legacy CFB variants), the
//! scrypt key derivation used by the config envelope, the zeroizing
//! [`EncryptionKey`] type, and salted hashing for local state.

pub mod cipher;
pub mod hash;
pub mod kdf;
pub mod key;

pub use cipher::{BlockCipher, CipherError, CipherSpec, lookup_cipher, supported_cipher_names};
pub use kdf::ScryptParams;
pub use key::EncryptionKey;

/// Largest key size any registered inner cipher uses, in bytes.
pub const MAX_KEY_SIZE: usize = 32;
