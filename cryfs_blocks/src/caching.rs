//! The caching layer: a bounded write-back cache of block payloads.
//!
//! Reads consult the cache first; writes land in the cache and mark the
//! entry dirty. A background sweeper periodically writes back and evicts
//! entries that have not been touched for a while, and shrinks the cache
//! back to its capacity, oldest entries first. Loads for the same id are
//! coalesced: at most one fetch from the base store is in flight per id.
//!
//! Entry life cycle: absent → `Loading` → `Resident` (clean or dirty)
//! → `Flushing` → `Resident` (clean) → absent. A write during `Flushing`
//! bumps the entry's generation counter, which tells the completing flush
//! that its data is stale and the entry has to stay dirty.
//!
//! The map lock is a plain mutex and is never held across I/O; every
//! operation follows lock – inspect – unlock – I/O – lock – finalize.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use cryfs_core::{
    BlockId, BlockStore, BlockStoreResult, RemoveResult, TryCreateResult, store::BlockIdStream,
};

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const MAX_ENTRY_AGE: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum EntryState {
    /// A fetch from the base store is in flight.
    Loading,
    /// Payload held in memory; `dirty` means the base store is stale.
    Resident { data: Bytes, dirty: bool },
    /// A write-back of `data` to the base store is in flight. The data is
    /// still current and servable to readers.
    Flushing { data: Bytes },
}

#[derive(Debug)]
struct CacheEntry {
    state: EntryState,
    last_access: Instant,
    /// Bumped on every write; lets an in-flight fetch or flush detect that
    /// it lost a race against a newer write.
    generation: u64,
}

impl CacheEntry {
    fn new(state: EntryState) -> Self {
        Self {
            state,
            last_access: Instant::now(),
            generation: 0,
        }
    }

    fn write(&mut self, data: Bytes) {
        self.state = EntryState::Resident { data, dirty: true };
        self.generation += 1;
        self.last_access = Instant::now();
    }

    fn data(&self) -> Option<&Bytes> {
        match &self.state {
            EntryState::Resident { data, .. } | EntryState::Flushing { data } => Some(data),
            EntryState::Loading => None,
        }
    }

    fn is_dirty(&self) -> bool {
        matches!(self.state, EntryState::Resident { dirty: true, .. })
    }
}

#[derive(Debug)]
struct CacheInner {
    base: Arc<dyn BlockStore>,
    entries: Mutex<HashMap<BlockId, CacheEntry>>,
    changed: Notify,
    capacity: usize,
}

impl CacheInner {
    /// Registers for a state change notification and releases the map
    /// lock. Registration happens before the lock is released, so a
    /// notification between unlock and await is not lost. Returning the
    /// future (instead of awaiting here) keeps the guard out of any
    /// future, so callers stay `Send`.
    fn change_listener(
        &self,
        guard: MutexGuard<'_, HashMap<BlockId, CacheEntry>>,
    ) -> std::pin::Pin<Box<tokio::sync::futures::Notified<'_>>> {
        let mut notified = Box::pin(self.changed.notified());
        notified.as_mut().enable();
        drop(guard);
        notified
    }

    /// Writes a dirty entry back to the base store. Returns without I/O if
    /// the entry is absent or clean; waits first if another flush of the
    /// same entry is in flight.
    async fn flush_entry(&self, id: &BlockId) -> BlockStoreResult<()> {
        let (data, generation) = loop {
            let notified = {
                let mut map = self.entries.lock().unwrap();
                match map.get_mut(id) {
                    Some(entry) => match &entry.state {
                        EntryState::Resident { data, dirty: true } => {
                            let data = data.clone();
                            let generation = entry.generation;
                            entry.state = EntryState::Flushing { data: data.clone() };
                            break (data, generation);
                        }
                        EntryState::Resident { dirty: false, .. } => return Ok(()),
                        EntryState::Flushing { .. } | EntryState::Loading => {
                            self.change_listener(map)
                        }
                    },
                    None => return Ok(()),
                }
            };
            notified.await;
        };

        let result = self.base.overwrite(id, data.clone()).await;

        let mut map = self.entries.lock().unwrap();
        if let Some(entry) = map.get_mut(id) {
            if entry.generation == generation && matches!(entry.state, EntryState::Flushing { .. })
            {
                entry.state = EntryState::Resident {
                    data,
                    dirty: result.is_err(),
                };
            }
            // Otherwise a newer write replaced the entry; leave it dirty.
        }
        drop(map);
        self.changed.notify_waiters();
        result
    }

    fn dirty_ids(&self) -> Vec<BlockId> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.is_dirty())
            .map(|(id, _)| *id)
            .collect()
    }

    async fn flush_all(&self) -> BlockStoreResult<()> {
        for id in self.dirty_ids() {
            self.flush_entry(&id).await?;
        }
        Ok(())
    }

    /// One sweeper pass: write back and evict entries that aged out, then
    /// evict oldest entries until the cache is back within capacity.
    async fn sweep(&self) {
        let now = Instant::now();
        let victims = {
            let map = self.entries.lock().unwrap();
            let mut by_age: Vec<(Instant, BlockId)> = map
                .iter()
                .filter(|(_, e)| !matches!(e.state, EntryState::Loading))
                .map(|(id, e)| (e.last_access, *id))
                .collect();
            by_age.sort();

            let overflow = map.len().saturating_sub(self.capacity);
            let mut victims = Vec::new();
            for (i, (last_access, id)) in by_age.iter().enumerate() {
                if i < overflow || now.duration_since(*last_access) > MAX_ENTRY_AGE {
                    victims.push(*id);
                }
            }
            victims
        };

        for id in victims {
            if let Err(e) = self.evict(&id).await {
                // Transient write-back errors are retried on the next sweep.
                warn!("failed to write back block {}: {e}", id.fmt_short());
            }
        }
    }

    async fn evict(&self, id: &BlockId) -> BlockStoreResult<()> {
        self.flush_entry(id).await?;
        let mut map = self.entries.lock().unwrap();
        if let Some(entry) = map.get(id) {
            // Only drop it if the flush above left it clean; a racing
            // write keeps the entry alive until the next sweep.
            if matches!(
                entry.state,
                EntryState::Resident { dirty: false, .. }
            ) {
                map.remove(id);
            }
        }
        drop(map);
        self.changed.notify_waiters();
        Ok(())
    }
}

/// Write-back cache over a base store.
#[derive(Debug)]
pub struct CachingBlockStore {
    inner: Arc<CacheInner>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Drop for CachingBlockStore {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl CachingBlockStore {
    /// Wraps `base` with a cache of at most `capacity` blocks. Must be
    /// called from within a tokio runtime; spawns the sweeper task.
    pub fn new(base: Arc<dyn BlockStore>, capacity: usize) -> Self {
        let inner = Arc::new(CacheInner {
            base,
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            capacity,
        });
        let sweeper_inner = Arc::downgrade(&inner);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = sweeper_inner.upgrade() else {
                    break;
                };
                inner.sweep().await;
            }
        });
        Self { inner, sweeper }
    }

    /// Cache capacity in blocks, derived from physical memory: a small
    /// fraction of it, bounded to stay useful on tiny and huge machines.
    pub fn default_capacity(block_physical_size: u64) -> usize {
        let total = total_memory_bytes();
        ((total / 64) / block_physical_size.max(1)).clamp(64, 16384) as usize
    }

    /// Synchronously places a payload into the cache, marking it dirty if
    /// `dirty`. Used by block handles on drop, where no async context is
    /// available; the sweeper takes care of write-back later.
    pub fn store_resident(&self, id: BlockId, data: Bytes, dirty: bool) {
        let mut map = self.inner.entries.lock().unwrap();
        match map.get_mut(&id) {
            Some(entry) if dirty => entry.write(data),
            Some(entry) => {
                entry.last_access = Instant::now();
            }
            None => {
                map.insert(
                    id,
                    CacheEntry::new(EntryState::Resident { data, dirty }),
                );
            }
        }
        drop(map);
        self.inner.changed.notify_waiters();
    }

    /// Writes a single dirty block back to the base store.
    pub async fn flush_block(&self, id: &BlockId) -> BlockStoreResult<()> {
        self.inner.flush_entry(id).await
    }

    #[cfg(test)]
    fn cached_block_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }
}

fn total_memory_bytes() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        // Fall back to a conservative guess if the sysconf probe fails.
        return 1 << 30;
    }
    pages as u64 * page_size as u64
}

#[async_trait::async_trait]
impl BlockStore for CachingBlockStore {
    async fn try_create(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<TryCreateResult> {
        // Reserve the id in the cache, then check the base store for an
        // existing block. The reservation makes concurrent try_create
        // calls for the same id serialize through the Loading state.
        loop {
            let notified = {
                let mut map = self.inner.entries.lock().unwrap();
                match map.get(id) {
                    Some(entry) if matches!(entry.state, EntryState::Loading) => {
                        self.inner.change_listener(map)
                    }
                    Some(_) => return Ok(TryCreateResult::AlreadyExists),
                    None => {
                        map.insert(*id, CacheEntry::new(EntryState::Loading));
                        break;
                    }
                }
            };
            notified.await;
        }

        let existing = self.inner.base.load(id).await;

        let mut map = self.inner.entries.lock().unwrap();
        let result = match existing {
            Ok(Some(base_data)) => {
                if let Some(entry) = map.get_mut(id) {
                    if entry.generation == 0 {
                        entry.state = EntryState::Resident {
                            data: base_data,
                            dirty: false,
                        };
                    }
                }
                Ok(TryCreateResult::AlreadyExists)
            }
            Ok(None) => match map.get_mut(id) {
                Some(entry) if entry.generation == 0 => {
                    entry.write(data);
                    Ok(TryCreateResult::Created)
                }
                // A concurrent write created the block while we checked.
                _ => Ok(TryCreateResult::AlreadyExists),
            },
            Err(e) => {
                if let Some(entry) = map.get(id) {
                    if entry.generation == 0 {
                        map.remove(id);
                    }
                }
                Err(e)
            }
        };
        drop(map);
        self.inner.changed.notify_waiters();
        result
    }

    async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()> {
        let mut map = self.inner.entries.lock().unwrap();
        match map.get_mut(id) {
            Some(entry) => entry.write(data),
            None => {
                map.insert(
                    *id,
                    CacheEntry::new(EntryState::Resident { data, dirty: true }),
                );
            }
        }
        drop(map);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<Bytes>> {
        loop {
            let notified = {
                let mut map = self.inner.entries.lock().unwrap();
                match map.get_mut(id) {
                    Some(entry) => match entry.data() {
                        Some(data) => {
                            let data = data.clone();
                            entry.last_access = Instant::now();
                            return Ok(Some(data));
                        }
                        None => {
                            // Coalesce with the fetch already in flight.
                            Some(self.inner.change_listener(map))
                        }
                    },
                    None => {
                        map.insert(*id, CacheEntry::new(EntryState::Loading));
                        None
                    }
                }
            };
            match notified {
                Some(notified) => {
                    notified.await;
                    continue;
                }
                None => break,
            }
        }

        let fetched = self.inner.base.load(id).await;

        let mut map = self.inner.entries.lock().unwrap();
        let result = match fetched {
            Ok(Some(data)) => {
                match map.get_mut(id) {
                    Some(entry) if entry.generation == 0 => {
                        entry.state = EntryState::Resident {
                            data: data.clone(),
                            dirty: false,
                        };
                        entry.last_access = Instant::now();
                        Ok(Some(data))
                    }
                    // A write overtook the fetch; its data is newer.
                    Some(entry) => Ok(entry.data().cloned()),
                    None => Ok(Some(data)),
                }
            }
            Ok(None) => {
                match map.get(id) {
                    Some(entry) if entry.generation == 0 => {
                        map.remove(id);
                        Ok(None)
                    }
                    Some(entry) => Ok(entry.data().cloned()),
                    None => Ok(None),
                }
            }
            Err(e) => {
                if let Some(entry) = map.get(id) {
                    if entry.generation == 0 {
                        map.remove(id);
                    }
                }
                Err(e)
            }
        };
        drop(map);
        self.inner.changed.notify_waiters();
        result
    }

    async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        let had_cached = loop {
            let notified = {
                let mut map = self.inner.entries.lock().unwrap();
                match map.get(id) {
                    None => break false,
                    Some(entry) => match entry.state {
                        EntryState::Resident { .. } => {
                            map.remove(id);
                            drop(map);
                            self.inner.changed.notify_waiters();
                            break true;
                        }
                        // Wait out in-flight fetches and write-backs so the
                        // base remove cannot be overtaken by a stale write.
                        EntryState::Loading | EntryState::Flushing { .. } => {
                            self.inner.change_listener(map)
                        }
                    },
                }
            };
            notified.await;
        };

        let base_result = self.inner.base.remove(id).await?;
        if had_cached || base_result == RemoveResult::Removed {
            Ok(RemoveResult::Removed)
        } else {
            Ok(RemoveResult::NotRemovedBecauseItDoesntExist)
        }
    }

    async fn num_blocks(&self) -> BlockStoreResult<u64> {
        // Make the base store authoritative before counting.
        self.inner.flush_all().await?;
        self.inner.base.num_blocks().await
    }

    fn estimate_free_bytes(&self) -> BlockStoreResult<u64> {
        self.inner.base.estimate_free_bytes()
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        self.inner.base.block_size_from_physical(physical)
    }

    async fn block_ids(&self) -> BlockStoreResult<BlockIdStream> {
        self.inner.flush_all().await?;
        self.inner.base.block_ids().await
    }

    async fn flush(&self) -> BlockStoreResult<()> {
        self.inner.flush_all().await?;
        self.inner.base.flush().await
    }
}
