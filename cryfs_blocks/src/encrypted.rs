//! The encryption layer: per-block authenticated encryption.
//!
//! Each block payload is encrypted under the filesystem key with a fresh
//! random IV; the stored bytes are `iv || ciphertext || tag`. The block id
//! is bound as additional authenticated data, so a ciphertext moved to a
//! different id fails authentication here even before the integrity layer
//! sees it. Legacy CFB ciphers have no tag; for them the integrity layer's
//! header check is the only tamper detection, which is why mounting such a
//! filesystem logs a warning.

use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

use cryfs_core::{
    BlockId, BlockStore, BlockStoreError, BlockStoreResult, RemoveResult, TryCreateResult,
    store::BlockIdStream,
};
use cryfs_crypto::cipher::BlockCipher;

pub struct EncryptedBlockStore {
    base: Arc<dyn BlockStore>,
    cipher: BlockCipher,
}

impl std::fmt::Debug for EncryptedBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBlockStore")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl EncryptedBlockStore {
    pub fn new(base: Arc<dyn BlockStore>, cipher: BlockCipher) -> Self {
        if cipher.spec().warns_about_integrity {
            warn!(
                "cipher {} does not authenticate ciphertexts; consider migrating to an AEAD cipher",
                cipher.spec().name
            );
        }
        Self { base, cipher }
    }

    fn encrypt(&self, id: &BlockId, data: &[u8]) -> BlockStoreResult<Bytes> {
        let ciphertext = self
            .cipher
            .encrypt(data, id.as_bytes())
            .map_err(|e| BlockStoreError::corrupted(*id, format!("encryption failed: {e}")))?;
        Ok(Bytes::from(ciphertext))
    }

    fn decrypt(&self, id: &BlockId, data: &[u8]) -> BlockStoreResult<Bytes> {
        let plaintext = self
            .cipher
            .decrypt(data, id.as_bytes())
            .map_err(|e| BlockStoreError::corrupted(*id, e.to_string()))?;
        Ok(Bytes::from(plaintext))
    }
}

#[async_trait::async_trait]
impl BlockStore for EncryptedBlockStore {
    async fn try_create(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<TryCreateResult> {
        let ciphertext = self.encrypt(id, &data)?;
        self.base.try_create(id, ciphertext).await
    }

    async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()> {
        let ciphertext = self.encrypt(id, &data)?;
        self.base.overwrite(id, ciphertext).await
    }

    async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<Bytes>> {
        match self.base.load(id).await? {
            Some(ciphertext) => Ok(Some(self.decrypt(id, &ciphertext)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        self.base.remove(id).await
    }

    async fn num_blocks(&self) -> BlockStoreResult<u64> {
        self.base.num_blocks().await
    }

    fn estimate_free_bytes(&self) -> BlockStoreResult<u64> {
        self.base.estimate_free_bytes()
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        self.base
            .block_size_from_physical(physical)
            .saturating_sub(self.cipher.spec().ciphertext_overhead() as u64)
    }

    async fn block_ids(&self) -> BlockStoreResult<BlockIdStream> {
        self.base.block_ids().await
    }

    async fn flush(&self) -> BlockStoreResult<()> {
        self.base.flush().await
    }
}
