//! The integrity layer: versioned per-block headers over a base store.
//!
//! Every block written through this layer is prefixed with
//! `[format(u8)][writer client id(u32 LE)][block id(16)][version(u64 LE)]`.
//! On read the header is checked against [`KnownBlockVersions`]: a version
//! older than what we saw is a rollback, a header naming a different block
//! id is a reassignment, and (optionally) a block that disappears although
//! we know it existed is a deletion attack.

pub mod known_block_versions;

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use cryfs_core::{
    BlockId, BlockStore, BlockStoreError, BlockStoreResult, IntegrityViolationError, RemoveResult,
    TryCreateResult, block_id::BLOCK_ID_LEN, store::BlockIdStream,
};

pub use known_block_versions::{CLIENT_ID_FOR_DELETED_BLOCK, KnownBlockVersions};

const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 1 + 4 + BLOCK_ID_LEN + 8;

/// Behavior switches for the integrity layer.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityConfig {
    /// Log violations instead of failing and tainting the filesystem.
    pub allow_integrity_violations: bool,
    /// Treat a once-seen block that is now absent as a deletion attack.
    pub missing_block_is_integrity_violation: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            allow_integrity_violations: false,
            missing_block_is_integrity_violation: false,
        }
    }
}

#[derive(Debug)]
pub struct IntegrityBlockStore {
    base: Arc<dyn BlockStore>,
    state: Mutex<KnownBlockVersions>,
    my_client_id: u32,
    config: IntegrityConfig,
}

impl IntegrityBlockStore {
    pub fn new(
        base: Arc<dyn BlockStore>,
        state: KnownBlockVersions,
        my_client_id: u32,
        config: IntegrityConfig,
    ) -> Self {
        Self {
            base,
            state: Mutex::new(state),
            my_client_id,
            config,
        }
    }

    pub fn is_tainted(&self) -> bool {
        self.state.lock().unwrap().is_tainted()
    }

    /// Persist the known-versions state; called on unmount and after flush.
    pub fn save_state(&self) -> BlockStoreResult<()> {
        self.state.lock().unwrap().persist()?;
        Ok(())
    }

    fn add_header(&self, id: BlockId, version: u64, data: &[u8]) -> Bytes {
        let mut block = BytesMut::with_capacity(HEADER_SIZE + data.len());
        block.put_u8(FORMAT_VERSION);
        block.put_u32_le(self.my_client_id);
        block.put_slice(id.as_bytes());
        block.put_u64_le(version);
        block.put_slice(data);
        block.freeze()
    }

    fn parse_header(id: &BlockId, data: &Bytes) -> BlockStoreResult<ParsedBlock> {
        if data.len() < HEADER_SIZE {
            return Err(BlockStoreError::corrupted(*id, "too small for header"));
        }
        if data[0] != FORMAT_VERSION {
            return Err(BlockStoreError::corrupted(
                *id,
                format!("unknown integrity format version {}", data[0]),
            ));
        }
        let client_id = u32::from_le_bytes(data[1..5].try_into().unwrap());
        let claimed_id = BlockId::from_slice(&data[5..5 + BLOCK_ID_LEN]).unwrap();
        let version = u64::from_le_bytes(data[21..29].try_into().unwrap());
        Ok(ParsedBlock {
            client_id,
            claimed_id,
            version,
            payload: data.slice(HEADER_SIZE..),
        })
    }

    /// Either fails the operation (tainting the filesystem) or, when
    /// violations are allowed by config, logs and carries on.
    fn report_violation(&self, violation: IntegrityViolationError) -> BlockStoreResult<()> {
        if self.config.allow_integrity_violations {
            warn!("integrity violation ignored by config: {violation}");
            return Ok(());
        }
        {
            let mut state = self.state.lock().unwrap();
            state.set_tainted();
            if let Err(e) = state.persist() {
                warn!("failed to persist integrity state after violation: {e}");
            }
        }
        Err(violation.into())
    }
}

struct ParsedBlock {
    client_id: u32,
    claimed_id: BlockId,
    version: u64,
    payload: Bytes,
}

#[async_trait::async_trait]
impl BlockStore for IntegrityBlockStore {
    async fn try_create(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<TryCreateResult> {
        let version = self
            .state
            .lock()
            .unwrap()
            .increment_version(self.my_client_id, *id);
        self.base
            .try_create(id, self.add_header(*id, version, &data))
            .await
    }

    async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()> {
        let version = self
            .state
            .lock()
            .unwrap()
            .increment_version(self.my_client_id, *id);
        self.base
            .overwrite(id, self.add_header(*id, version, &data))
            .await
    }

    async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<Bytes>> {
        let Some(data) = self.base.load(id).await? else {
            let should_exist = self.state.lock().unwrap().block_should_exist(id);
            if should_exist && self.config.missing_block_is_integrity_violation {
                self.report_violation(IntegrityViolationError::MissingBlock { id: *id })?;
            }
            return Ok(None);
        };

        let block = Self::parse_header(id, &data)?;

        if block.claimed_id != *id {
            self.report_violation(IntegrityViolationError::IdMismatch {
                id: *id,
                claimed: block.claimed_id,
            })?;
        }

        let check = {
            let mut state = self.state.lock().unwrap();
            if block.client_id != self.my_client_id && !state.is_known_client(block.client_id) {
                info!(
                    "block {} written by client {} we have not seen before; trusting on first use",
                    id.fmt_short(),
                    block.client_id
                );
            }
            state.check_and_update(block.client_id, *id, block.version)
        };
        if let Err(violation) = check {
            self.report_violation(violation)?;
        }

        Ok(Some(block.payload))
    }

    async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        self.state.lock().unwrap().mark_block_as_deleted(*id);
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
            .saturating_sub(HEADER_SIZE as u64)
    }

    async fn block_ids(&self) -> BlockStoreResult<BlockIdStream> {
        self.base.block_ids().await
    }

    async fn flush(&self) -> BlockStoreResult<()> {
        self.save_state()?;
        self.base.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryfs_core::testutil::{BlockStoreTests, random_bytes};
    use cryfs_store_memory::InMemoryBlockStore;

    const MY_CLIENT: u32 = 0x1234;

    fn store_over(base: Arc<InMemoryBlockStore>, config: IntegrityConfig) -> IntegrityBlockStore {
        IntegrityBlockStore::new(
            base,
            KnownBlockVersions::new_in_memory(),
            MY_CLIENT,
            config,
        )
    }

    fn default_store() -> (Arc<InMemoryBlockStore>, IntegrityBlockStore) {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = store_over(base.clone(), IntegrityConfig::default());
        (base, store)
    }

    #[tokio::test]
    async fn store_contract() {
        let (_base, store) = default_store();
        BlockStoreTests::new(&store).run_all().await.unwrap();
    }

    #[tokio::test]
    async fn header_layout_is_stable() {
        let (base, store) = default_store();
        let id = store.create_block_id();
        store
            .try_create(&id, Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let raw = base.load(&id).await.unwrap().unwrap();
        assert_eq!(FORMAT_VERSION, raw[0]);
        assert_eq!(MY_CLIENT, u32::from_le_bytes(raw[1..5].try_into().unwrap()));
        assert_eq!(id.as_bytes(), &raw[5..21]);
        assert_eq!(1, u64::from_le_bytes(raw[21..29].try_into().unwrap()));
        assert_eq!(b"payload", &raw[29..]);
    }

    #[tokio::test]
    async fn versions_increase_per_write() {
        let (base, store) = default_store();
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(16)).await.unwrap();
        store.overwrite(&id, random_bytes(16)).await.unwrap();
        store.overwrite(&id, random_bytes(16)).await.unwrap();

        let raw = base.load(&id).await.unwrap().unwrap();
        assert_eq!(3, u64::from_le_bytes(raw[21..29].try_into().unwrap()));
    }

    #[tokio::test]
    async fn detects_rollback() {
        let (base, store) = default_store();
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(16)).await.unwrap();
        let old_ciphertext = base.load(&id).await.unwrap().unwrap();

        store.overwrite(&id, random_bytes(16)).await.unwrap();
        store.load(&id).await.unwrap();

        // An attacker restores the old block file.
        base.overwrite(&id, old_ciphertext).await.unwrap();
        let result = store.load(&id).await;
        assert!(matches!(
            result,
            Err(BlockStoreError::IntegrityViolation(
                IntegrityViolationError::RollBack { .. }
            ))
        ));
        assert!(store.is_tainted());
    }

    #[tokio::test]
    async fn detects_block_reassignment() {
        let (base, store) = default_store();
        let a = store.create_block_id();
        let b = store.create_block_id();
        store.try_create(&a, random_bytes(16)).await.unwrap();
        store.try_create(&b, random_bytes(16)).await.unwrap();

        // An attacker copies block a's file over block b's.
        let a_raw = base.load(&a).await.unwrap().unwrap();
        base.overwrite(&b, a_raw).await.unwrap();

        assert!(matches!(
            store.load(&b).await,
            Err(BlockStoreError::IntegrityViolation(
                IntegrityViolationError::IdMismatch { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn detects_deleted_block_reappearing() {
        let (base, store) = default_store();
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(16)).await.unwrap();
        store.load(&id).await.unwrap();
        let old_ciphertext = base.load(&id).await.unwrap().unwrap();

        store.remove(&id).await.unwrap();
        base.overwrite(&id, old_ciphertext).await.unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(BlockStoreError::IntegrityViolation(
                IntegrityViolationError::DeletedBlockReappeared { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn missing_block_is_violation_when_configured() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = store_over(
            base.clone(),
            IntegrityConfig {
                allow_integrity_violations: false,
                missing_block_is_integrity_violation: true,
            },
        );
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(16)).await.unwrap();
        store.load(&id).await.unwrap();

        // An attacker deletes the block file behind our back.
        base.remove(&id).await.unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(BlockStoreError::IntegrityViolation(
                IntegrityViolationError::MissingBlock { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn missing_block_is_none_by_default() {
        let (base, store) = default_store();
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(16)).await.unwrap();
        store.load(&id).await.unwrap();
        base.remove(&id).await.unwrap();

        assert_eq!(None, store.load(&id).await.unwrap());
    }

    #[tokio::test]
    async fn allowed_violations_only_log() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = store_over(
            base.clone(),
            IntegrityConfig {
                allow_integrity_violations: true,
                missing_block_is_integrity_violation: false,
            },
        );
        let id = store.create_block_id();
        let old_payload = random_bytes(16);
        store.try_create(&id, old_payload.clone()).await.unwrap();
        let old_ciphertext = base.load(&id).await.unwrap().unwrap();
        store.overwrite(&id, random_bytes(16)).await.unwrap();
        base.overwrite(&id, old_ciphertext).await.unwrap();

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(Some(old_payload), loaded);
        assert!(!store.is_tainted());
    }

    #[tokio::test]
    async fn accepts_blocks_from_unknown_clients() {
        // Trust on first use: another client's block loads fine.
        let base = Arc::new(InMemoryBlockStore::new());
        let other_client_store = IntegrityBlockStore::new(
            base.clone(),
            KnownBlockVersions::new_in_memory(),
            0x9999,
            IntegrityConfig::default(),
        );
        let id = other_client_store.create_block_id();
        let payload = random_bytes(16);
        other_client_store
            .try_create(&id, payload.clone())
            .await
            .unwrap();

        let my_store = store_over(base, IntegrityConfig::default());
        assert_eq!(Some(payload), my_store.load(&id).await.unwrap());
    }

    #[tokio::test]
    async fn truncated_block_is_corrupted() {
        let (base, store) = default_store();
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(16)).await.unwrap();
        base.overwrite(&id, Bytes::from_static(&[1, 2, 3])).await.unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(BlockStoreError::CorruptedBlock { .. })
        ));
    }

    #[test]
    fn physical_block_size_subtracts_header() {
        let base = Arc::new(InMemoryBlockStore::new());
        let store = store_over(base, IntegrityConfig::default());
        assert_eq!(32768 - 29, store.block_size_from_physical(32768));
    }
}
