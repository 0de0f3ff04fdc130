//! The parallel-access layer: one in-memory representative per block.
//!
//! For any block id there is at most one [`OpenBlock`] in memory at a time;
//! concurrent loaders share it through reference-counted [`BlockRef`]
//! handles. When the last handle drops, the block's (possibly modified)
//! payload is pushed into the caching layer below and the block leaves the
//! open map. A `remove` issued while handles are outstanding parks on a
//! oneshot signal and completes when the last handle drops; it is not
//! cancellable. Loads issued while a remove is parked observe the block as
//! already gone.
//!
//! The open map is guarded by a plain mutex that is never held across I/O;
//! in-flight fetches are marked with a placeholder state that other
//! operations wait out.

use bytes::Bytes;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{Notify, oneshot};

use cryfs_core::{
    BlockId, BlockStore, BlockStoreResult, RemoveResult, TryCreateResult, store::BlockIdStream,
};

use crate::caching::CachingBlockStore;

/// The in-memory representative of a block.
#[derive(Debug)]
pub struct OpenBlock {
    id: BlockId,
    data: RwLock<OpenBlockData>,
}

#[derive(Debug)]
struct OpenBlockData {
    bytes: Vec<u8>,
    dirty: bool,
}

impl OpenBlock {
    fn new(id: BlockId, bytes: Vec<u8>) -> Self {
        Self {
            id,
            data: RwLock::new(OpenBlockData {
                bytes,
                dirty: false,
            }),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.data.read().unwrap().bytes.len()
    }

    /// Read access to the payload.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read().unwrap().bytes)
    }

    /// Mutate the payload; marks the block dirty.
    pub fn update<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut data = self.data.write().unwrap();
        data.dirty = true;
        f(&mut data.bytes)
    }

    /// Replaces the whole payload.
    pub fn write_all(&self, bytes: &[u8]) {
        self.update(|data| {
            data.clear();
            data.extend_from_slice(bytes);
        });
    }

    fn snapshot(&self) -> (Bytes, bool) {
        let data = self.data.read().unwrap();
        (Bytes::copy_from_slice(&data.bytes), data.dirty)
    }

    fn clear_dirty(&self) {
        self.data.write().unwrap().dirty = false;
    }
}

enum OpenState {
    /// A fetch or creation is in flight for this id.
    Fetching,
    Open(OpenEntry),
}

struct OpenEntry {
    block: Arc<OpenBlock>,
    refcount: u32,
    pending_removes: Vec<oneshot::Sender<()>>,
}

struct PoolInner {
    cache: Arc<CachingBlockStore>,
    open: Mutex<HashMap<BlockId, OpenState>>,
    changed: Notify,
}

impl PoolInner {
    /// Registers for a map change notification and releases the lock; the
    /// caller awaits the returned future. Keeping the guard out of the
    /// future keeps callers `Send`.
    fn change_listener(
        &self,
        guard: MutexGuard<'_, HashMap<BlockId, OpenState>>,
    ) -> std::pin::Pin<Box<tokio::sync::futures::Notified<'_>>> {
        let mut notified = Box::pin(self.changed.notified());
        notified.as_mut().enable();
        drop(guard);
        notified
    }

    /// Called by the last dropping handle: pushes the payload into the
    /// cache (unless a remove is parked) and fires parked removes. The map
    /// lock stays held while pushing so a racing load cannot slip in
    /// between map removal and the cache seeing the data.
    fn release(&self, id: BlockId) {
        let mut map = self.open.lock().unwrap();
        let Some(OpenState::Open(entry)) = map.get_mut(&id) else {
            unreachable!("open map entry disappeared while handles were alive");
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        let Some(OpenState::Open(entry)) = map.remove(&id) else {
            unreachable!();
        };
        if entry.pending_removes.is_empty() {
            let (bytes, dirty) = entry.block.snapshot();
            if dirty {
                self.cache.store_resident(id, bytes, true);
            }
        }
        drop(map);
        for tx in entry.pending_removes {
            let _ = tx.send(());
        }
        self.changed.notify_waiters();
    }
}

/// Reference-counted handle to an [`OpenBlock`].
///
/// All handles for the same id point at the same block. Dropping the last
/// one releases the block to the caching layer.
pub struct BlockRef {
    block: Arc<OpenBlock>,
    pool: Arc<PoolInner>,
}

impl Deref for BlockRef {
    type Target = OpenBlock;

    fn deref(&self) -> &OpenBlock {
        &self.block
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        let mut map = self.pool.open.lock().unwrap();
        match map.get_mut(&self.block.id()) {
            Some(OpenState::Open(entry)) => entry.refcount += 1,
            _ => unreachable!("cloning a handle whose block is not open"),
        }
        drop(map);
        Self {
            block: self.block.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.pool.release(self.block.id());
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockRef({})", self.block.id())
    }
}

/// Hands out singleton [`BlockRef`] handles over the caching layer.
pub struct ParallelAccessBlockStore {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ParallelAccessBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelAccessBlockStore").finish_non_exhaustive()
    }
}

impl ParallelAccessBlockStore {
    pub fn new(cache: Arc<CachingBlockStore>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cache,
                open: Mutex::new(HashMap::new()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn create_block_id(&self) -> BlockId {
        self.inner.cache.create_block_id()
    }

    fn handle(&self, block: Arc<OpenBlock>) -> BlockRef {
        BlockRef {
            block,
            pool: self.inner.clone(),
        }
    }

    /// Opens the block, sharing the in-memory representative with any other
    /// outstanding handles. Returns `None` for an unknown id or one with a
    /// parked remove.
    pub async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<BlockRef>> {
        loop {
            let notified = {
                let mut map = self.inner.open.lock().unwrap();
                match map.get_mut(id) {
                    Some(OpenState::Open(entry)) => {
                        if !entry.pending_removes.is_empty() {
                            return Ok(None);
                        }
                        entry.refcount += 1;
                        let block = entry.block.clone();
                        drop(map);
                        return Ok(Some(self.handle(block)));
                    }
                    Some(OpenState::Fetching) => self.inner.change_listener(map),
                    None => {
                        map.insert(*id, OpenState::Fetching);
                        break;
                    }
                }
            };
            notified.await;
        }

        let loaded = self.inner.cache.load(id).await;

        let mut map = self.inner.open.lock().unwrap();
        let result = match loaded {
            Ok(Some(data)) => {
                let block = Arc::new(OpenBlock::new(*id, data.to_vec()));
                map.insert(
                    *id,
                    OpenState::Open(OpenEntry {
                        block: block.clone(),
                        refcount: 1,
                        pending_removes: Vec::new(),
                    }),
                );
                Ok(Some(self.handle(block)))
            }
            Ok(None) => {
                map.remove(id);
                Ok(None)
            }
            Err(e) => {
                map.remove(id);
                Err(e)
            }
        };
        drop(map);
        self.inner.changed.notify_waiters();
        result
    }

    /// Creates a block under a fresh random id and opens it.
    pub async fn create(&self, data: Bytes) -> BlockStoreResult<BlockRef> {
        loop {
            let id = self.create_block_id();
            if let Some(handle) = self.try_create(&id, data.clone()).await? {
                return Ok(handle);
            }
            // Random id collision; roll again.
        }
    }

    /// Creates a block under the given id, or returns `None` if it exists.
    pub async fn try_create(
        &self,
        id: &BlockId,
        data: Bytes,
    ) -> BlockStoreResult<Option<BlockRef>> {
        loop {
            let notified = {
                let mut map = self.inner.open.lock().unwrap();
                match map.get(id) {
                    Some(OpenState::Open(_)) => return Ok(None),
                    Some(OpenState::Fetching) => self.inner.change_listener(map),
                    None => {
                        map.insert(*id, OpenState::Fetching);
                        break;
                    }
                }
            };
            notified.await;
        }

        let created = self.inner.cache.try_create(id, data.clone()).await;

        let mut map = self.inner.open.lock().unwrap();
        let result = match created {
            Ok(TryCreateResult::Created) => {
                let block = Arc::new(OpenBlock::new(*id, data.to_vec()));
                map.insert(
                    *id,
                    OpenState::Open(OpenEntry {
                        block: block.clone(),
                        refcount: 1,
                        pending_removes: Vec::new(),
                    }),
                );
                Ok(Some(self.handle(block)))
            }
            Ok(TryCreateResult::AlreadyExists) => {
                map.remove(id);
                Ok(None)
            }
            Err(e) => {
                map.remove(id);
                Err(e)
            }
        };
        drop(map);
        self.inner.changed.notify_waiters();
        result
    }

    /// Replaces the block's payload whether or not it is open.
    pub async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()> {
        loop {
            let notified = {
                let mut map = self.inner.open.lock().unwrap();
                match map.get_mut(id) {
                    Some(OpenState::Open(entry)) => {
                        entry.block.write_all(&data);
                        return Ok(());
                    }
                    Some(OpenState::Fetching) => self.inner.change_listener(map),
                    None => {
                        // Reserve the id so a concurrent load cannot open stale
                        // data while our write is on its way into the cache.
                        map.insert(*id, OpenState::Fetching);
                        break;
                    }
                }
            };
            notified.await;
        }

        let result = self.inner.cache.overwrite(id, data).await;
        let mut map = self.inner.open.lock().unwrap();
        map.remove(id);
        drop(map);
        self.inner.changed.notify_waiters();
        result
    }

    /// Removes the block. If handles are outstanding, parks until the last
    /// one drops; the wait is not cancellable.
    pub async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        let parked = loop {
            let notified = {
                let mut map = self.inner.open.lock().unwrap();
                match map.get_mut(id) {
                    Some(OpenState::Open(entry)) => {
                        let (tx, rx) = oneshot::channel();
                        entry.pending_removes.push(tx);
                        break Some(rx);
                    }
                    Some(OpenState::Fetching) => self.inner.change_listener(map),
                    None => break None,
                }
            };
            notified.await;
        };

        let was_open = parked.is_some();
        if let Some(rx) = parked {
            let _ = rx.await;
        }

        let removed = self.inner.cache.remove(id).await?;
        if was_open || removed == RemoveResult::Removed {
            Ok(RemoveResult::Removed)
        } else {
            Ok(RemoveResult::NotRemovedBecauseItDoesntExist)
        }
    }

    /// Pushes the handle's payload into the cache and writes it through to
    /// the base store. After this returns, all prior writes through the
    /// handle have reached the base store.
    pub async fn flush_block(&self, block: &BlockRef) -> BlockStoreResult<()> {
        let id = block.id();
        let (bytes, dirty) = block.block.snapshot();
        if dirty {
            self.inner.cache.store_resident(id, bytes, true);
            block.block.clear_dirty();
        }
        self.inner.cache.flush_block(&id).await
    }

    /// Pushes every open dirty block into the cache and flushes everything
    /// to the base store.
    pub async fn flush_all(&self) -> BlockStoreResult<()> {
        let open_blocks: Vec<Arc<OpenBlock>> = {
            let map = self.inner.open.lock().unwrap();
            map.values()
                .filter_map(|state| match state {
                    OpenState::Open(entry) => Some(entry.block.clone()),
                    OpenState::Fetching => None,
                })
                .collect()
        };
        for block in open_blocks {
            let (bytes, dirty) = block.snapshot();
            if dirty {
                self.inner.cache.store_resident(block.id(), bytes, true);
                block.clear_dirty();
            }
        }
        self.inner.cache.flush().await
    }

    pub async fn num_blocks(&self) -> BlockStoreResult<u64> {
        self.inner.cache.num_blocks().await
    }

    pub fn estimate_free_bytes(&self) -> BlockStoreResult<u64> {
        self.inner.cache.estimate_free_bytes()
    }

    pub fn block_size_from_physical(&self, physical: u64) -> u64 {
        self.inner.cache.block_size_from_physical(physical)
    }

    pub async fn block_ids(&self) -> BlockStoreResult<BlockIdStream> {
        self.inner.cache.block_ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryfs_core::testutil::random_bytes;
    use cryfs_store_memory::InMemoryBlockStore;
    use std::time::Duration;

    fn pool() -> (Arc<InMemoryBlockStore>, ParallelAccessBlockStore) {
        let base = Arc::new(InMemoryBlockStore::new());
        let cache = Arc::new(CachingBlockStore::new(base.clone(), 100));
        (base, ParallelAccessBlockStore::new(cache))
    }

    #[tokio::test]
    async fn concurrent_handles_share_one_open_block() {
        let (_base, pool) = pool();
        let created = pool.create(random_bytes(64)).await.unwrap();
        let id = created.id();

        let loaded = pool.load(&id).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&created.block, &loaded.block));

        let cloned = loaded.clone();
        assert!(Arc::ptr_eq(&created.block, &cloned.block));
    }

    #[tokio::test]
    async fn writes_are_visible_after_reopen() {
        let (_base, pool) = pool();
        let block = pool.create(random_bytes(64)).await.unwrap();
        let id = block.id();
        block.write_all(b"hello");
        drop(block);

        let reopened = pool.load(&id).await.unwrap().unwrap();
        reopened.with_data(|data| assert_eq!(b"hello", data));
    }

    #[tokio::test]
    async fn data_survives_flush_to_base() {
        let (base, pool) = pool();
        let block = pool.create(Bytes::from_static(b"payload")).await.unwrap();
        let id = block.id();
        pool.flush_block(&block).await.unwrap();

        assert_eq!(
            Some(Bytes::from_static(b"payload")),
            base.load(&id).await.unwrap()
        );
    }

    #[tokio::test]
    async fn load_of_unknown_block_is_none() {
        let (_base, pool) = pool();
        let id = pool.create_block_id();
        assert!(pool.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_of_closed_block_is_immediate() {
        let (_base, pool) = pool();
        let block = pool.create(random_bytes(16)).await.unwrap();
        let id = block.id();
        drop(block);

        assert_eq!(RemoveResult::Removed, pool.remove(&id).await.unwrap());
        assert!(pool.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_waits_for_last_handle() {
        let (_base, pool) = pool();
        let pool = Arc::new(pool);
        let block = pool.create(random_bytes(16)).await.unwrap();
        let second = block.clone();
        let id = block.id();

        let remover = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.remove(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished(), "remove should park on open handles");

        drop(block);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished(), "one handle is still outstanding");

        drop(second);
        let result = remover.await.unwrap().unwrap();
        assert_eq!(RemoveResult::Removed, result);
        assert!(pool.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_while_remove_is_parked_sees_block_gone() {
        let (_base, pool) = pool();
        let pool = Arc::new(pool);
        let block = pool.create(random_bytes(16)).await.unwrap();
        let id = block.id();

        let remover = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.remove(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(pool.load(&id).await.unwrap().is_none());

        drop(block);
        remover.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn try_create_existing_id_returns_none() {
        let (_base, pool) = pool();
        let block = pool.create(random_bytes(16)).await.unwrap();
        let id = block.id();
        drop(block);

        assert!(pool.try_create(&id, random_bytes(16)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_open_block_updates_in_memory_copy() {
        let (_base, pool) = pool();
        let block = pool.create(random_bytes(16)).await.unwrap();
        let id = block.id();

        pool.overwrite(&id, Bytes::from_static(b"new")).await.unwrap();
        block.with_data(|data| assert_eq!(b"new", data));
    }

    #[tokio::test]
    async fn unmodified_block_is_not_written_back(){
        let (base, pool) = pool();
        let block = pool.create(Bytes::from_static(b"original")).await.unwrap();
        let id = block.id();
        pool.flush_block(&block).await.unwrap();
        drop(block);

        let reopened = pool.load(&id).await.unwrap().unwrap();
        drop(reopened);
        pool.flush_all().await.unwrap();
        assert_eq!(
            Some(Bytes::from_static(b"original")),
            base.load(&id).await.unwrap()
        );
    }
}
