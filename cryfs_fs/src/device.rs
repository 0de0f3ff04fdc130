//! The path-based object model the adapter layer calls into.
//!
//! Every operation resolves its path from the root directory blob, then
//! takes the affected directory's lock before mutating that directory's
//! entry table. Two different directories can be mutated in parallel;
//! cross-directory renames take both locks in a deterministic order.
//!
//! Unlinking a file that still has open handles removes its directory
//! entry immediately but keeps the blob alive until the last handle is
//! closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use cryfs_blocks::ParallelAccessBlockStore;
use cryfs_core::BlockId;
use tracing::warn;

use crate::context::Context;
use crate::error::{FsError, FsResult};
use crate::fsblob::dir_entries::{DirEntry, EntryKind};
use crate::fsblob::{DirBlob, FileBlob, FsBlob, FsBlobStore};

/// Longest allowed name of a single path component.
pub const MAX_NAME_LENGTH: usize = 255;

/// Size reported for directories in stat results.
const DIR_SIZE: u64 = 4096;

/// stat() result at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// One readdir result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
}

/// statfs() result at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statfs {
    pub block_size: u32,
    pub num_total_blocks: u64,
    pub num_free_blocks: u64,
    pub num_available_blocks: u64,
    pub max_filename_length: u32,
}

#[derive(Debug, Default)]
struct DirLocks {
    locks: Mutex<HashMap<BlockId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DirLocks {
    fn mutex_for(&self, id: BlockId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .clone()
    }

    async fn lock(&self, id: BlockId) -> tokio::sync::OwnedMutexGuard<()> {
        self.mutex_for(id).lock_owned().await
    }

    /// Locks two directories in id order so concurrent cross-directory
    /// renames cannot deadlock.
    async fn lock_pair(
        &self,
        a: BlockId,
        b: BlockId,
    ) -> (
        tokio::sync::OwnedMutexGuard<()>,
        Option<tokio::sync::OwnedMutexGuard<()>>,
    ) {
        if a == b {
            (self.lock(a).await, None)
        } else if a < b {
            let first = self.lock(a).await;
            let second = self.lock(b).await;
            (first, Some(second))
        } else {
            let second = self.lock(b).await;
            let first = self.lock(a).await;
            (first, Some(second))
        }
    }
}

#[derive(Default)]
struct OpenFileTracking {
    count: u32,
    unlink_pending: bool,
}

#[derive(Debug)]
struct DeviceInner {
    fsblobs: FsBlobStore,
    blocks: Arc<ParallelAccessBlockStore>,
    root_id: BlockId,
    context: Context,
    block_size_bytes: u64,
    dir_locks: DirLocks,
    open_files: Mutex<HashMap<BlockId, OpenFileTracking>>,
}

impl DeviceInner {
    /// Decrements the open count; returns true if the blob should be
    /// removed now (deferred unlink, last handle gone).
    fn note_closed(&self, blob_id: BlockId) -> bool {
        let mut map = self.open_files.lock().unwrap();
        let Some(tracking) = map.get_mut(&blob_id) else {
            return false;
        };
        tracking.count -= 1;
        if tracking.count == 0 {
            let pending = tracking.unlink_pending;
            map.remove(&blob_id);
            pending
        } else {
            false
        }
    }
}

/// The mounted filesystem's object layer.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

fn parse_path(path: &str) -> FsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidOperation(format!(
            "path {path:?} is not absolute"
        )));
    }
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(FsError::InvalidOperation(
                    "paths must be resolved before they reach the filesystem".into(),
                ));
            }
            name if name.len() > MAX_NAME_LENGTH => return Err(FsError::NameTooLong),
            name if name.contains('\0') => {
                return Err(FsError::InvalidOperation("name contains NUL".into()));
            }
            name => components.push(name),
        }
    }
    Ok(components)
}

impl Device {
    pub fn new(
        fsblobs: FsBlobStore,
        blocks: Arc<ParallelAccessBlockStore>,
        root_id: BlockId,
        context: Context,
        block_size_bytes: u64,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                fsblobs,
                blocks,
                root_id,
                context,
                block_size_bytes,
                dir_locks: DirLocks::default(),
                open_files: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn root_id(&self) -> BlockId {
        self.inner.root_id
    }

    async fn load_dir(&self, id: &BlockId) -> FsResult<DirBlob> {
        self.inner.fsblobs.load_existing(id).await?.into_dir()
    }

    /// Resolves directory components to the directory's blob id.
    async fn resolve_dir(&self, components: &[&str]) -> FsResult<BlockId> {
        let mut current = self.inner.root_id;
        for component in components {
            let dir = self.load_dir(&current).await?;
            let entry = dir.entry(component).ok_or(FsError::NotFound)?;
            if entry.kind != EntryKind::Dir {
                return Err(FsError::NotADirectory);
            }
            current = entry.blob_id;
        }
        Ok(current)
    }

    /// Splits a path into its parent directory's blob id and the final
    /// component. The root has no parent.
    async fn resolve_parent<'p>(&self, path: &'p str) -> FsResult<(BlockId, &'p str)> {
        let components = parse_path(path)?;
        let Some((&name, parents)) = components.split_last() else {
            return Err(FsError::InvalidOperation(
                "operation needs a non-root path".into(),
            ));
        };
        Ok((self.resolve_dir(parents).await?, name))
    }

    fn root_attrs(&self) -> NodeAttrs {
        let now = SystemTime::now();
        NodeAttrs {
            kind: EntryKind::Dir,
            mode: 0o755,
            uid: self.inner.context.uid,
            gid: self.inner.context.gid,
            size: DIR_SIZE,
            nlink: 2,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    async fn entry_size(&self, entry: &DirEntry) -> FsResult<u64> {
        match entry.kind {
            EntryKind::Dir => Ok(DIR_SIZE),
            EntryKind::File => match self.inner.fsblobs.load_existing(&entry.blob_id).await? {
                FsBlob::File(file) => file.size().await,
                _ => Err(FsError::Io(format!(
                    "entry {} points at a blob of a different kind",
                    entry.name
                ))),
            },
            EntryKind::Symlink => {
                let link = self
                    .inner
                    .fsblobs
                    .load_existing(&entry.blob_id)
                    .await?
                    .into_symlink()?;
                Ok(link.target().await?.len() as u64)
            }
        }
    }

    pub async fn stat(&self, path: &str) -> FsResult<NodeAttrs> {
        let components = parse_path(path)?;
        let Some((name, parents)) = components.split_last() else {
            return Ok(self.root_attrs());
        };
        let parent = self.resolve_dir(parents).await?;
        let dir = self.load_dir(&parent).await?;
        let entry = dir.entry(name).ok_or(FsError::NotFound)?.clone();
        let size = self.entry_size(&entry).await?;
        Ok(NodeAttrs {
            kind: entry.kind,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            size,
            nlink: if entry.kind == EntryKind::Dir { 2 } else { 1 },
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
        })
    }

    pub async fn mkdir(
        &self,
        path: &str,
        mode: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        if dir.entry(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let blob = self.inner.fsblobs.create_dir_blob().await?;
        dir.add_entry(DirEntry::new(
            EntryKind::Dir,
            name.to_string(),
            blob.id(),
            mode,
            uid.unwrap_or(self.inner.context.uid),
            gid.unwrap_or(self.inner.context.gid),
        ))?;
        dir.store().await
    }

    pub async fn create_file(
        &self,
        path: &str,
        mode: u32,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        if dir.entry(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let blob = self.inner.fsblobs.create_file_blob().await?;
        dir.add_entry(DirEntry::new(
            EntryKind::File,
            name.to_string(),
            blob.id(),
            mode,
            uid.unwrap_or(self.inner.context.uid),
            gid.unwrap_or(self.inner.context.gid),
        ))?;
        dir.store().await
    }

    pub async fn create_symlink(
        &self,
        path: &str,
        target: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        if dir.entry(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let blob = self.inner.fsblobs.create_symlink_blob(target).await?;
        dir.add_entry(DirEntry::new(
            EntryKind::Symlink,
            name.to_string(),
            blob.id(),
            0o777,
            uid.unwrap_or(self.inner.context.uid),
            gid.unwrap_or(self.inner.context.gid),
        ))?;
        dir.store().await
    }

    pub async fn read_symlink(&self, path: &str) -> FsResult<String> {
        let (parent, name) = self.resolve_parent(path).await?;
        let dir = self.load_dir(&parent).await?;
        let entry = dir.entry(name).ok_or(FsError::NotFound)?;
        if entry.kind != EntryKind::Symlink {
            return Err(FsError::InvalidOperation("not a symlink".into()));
        }
        let link = self
            .inner
            .fsblobs
            .load_existing(&entry.blob_id)
            .await?
            .into_symlink()?;
        link.target().await
    }

    pub async fn readdir(&self, path: &str) -> FsResult<Vec<DirEntryInfo>> {
        let components = parse_path(path)?;
        let dir_id = self.resolve_dir(&components).await?;
        let dir = self.load_dir(&dir_id).await?;
        let listing = dir
            .entries()
            .iter()
            .map(|entry| DirEntryInfo {
                name: entry.name.clone(),
                kind: entry.kind,
            })
            .collect();

        self.maybe_update_dir_atime(&components).await?;
        Ok(listing)
    }

    /// Applies the atime policy to the listed directory's own entry (in
    /// its parent); the root has no entry to update.
    async fn maybe_update_dir_atime(&self, components: &[&str]) -> FsResult<()> {
        let Some((name, parents)) = components.split_last() else {
            return Ok(());
        };
        let parent = self.resolve_dir(parents).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        let Some(entry) = dir.entry(name) else {
            return Ok(());
        };
        let update = self
            .inner
            .context
            .atime_behavior
            .should_update_atime_on_directory_read(entry.atime, entry.mtime, entry.ctime);
        if update {
            dir.set_atime(name, SystemTime::now())?;
            dir.store().await?;
        }
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        let entry = dir.entry(name).ok_or(FsError::NotFound)?;
        if entry.kind == EntryKind::Dir {
            return Err(FsError::IsADirectory);
        }
        let blob_id = entry.blob_id;
        dir.remove_entry(name)?;
        dir.store().await?;
        self.remove_blob_or_defer(blob_id).await
    }

    /// Removes a blob now, unless open handles keep it alive; then the
    /// last close removes it.
    async fn remove_blob_or_defer(&self, blob_id: BlockId) -> FsResult<()> {
        let remove_now = {
            let mut open = self.inner.open_files.lock().unwrap();
            match open.get_mut(&blob_id) {
                Some(tracking) if tracking.count > 0 => {
                    tracking.unlink_pending = true;
                    false
                }
                _ => true,
            }
        };
        if remove_now {
            self.inner.fsblobs.remove_by_id(&blob_id).await?;
        }
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let target_id = {
            let dir = self.load_dir(&parent).await?;
            let entry = dir.entry(name).ok_or(FsError::NotFound)?;
            if entry.kind != EntryKind::Dir {
                return Err(FsError::NotADirectory);
            }
            entry.blob_id
        };
        let (_parent_guard, _target_guard) =
            self.inner.dir_locks.lock_pair(parent, target_id).await;

        let mut dir = self.load_dir(&parent).await?;
        // Re-check under the lock.
        let entry = dir.entry(name).ok_or(FsError::NotFound)?;
        if entry.kind != EntryKind::Dir || entry.blob_id != target_id {
            return Err(FsError::NotADirectory);
        }
        let target = self.load_dir(&target_id).await?;
        if !target.entries().is_empty() {
            return Err(FsError::NotEmpty);
        }
        dir.remove_entry(name)?;
        dir.store().await?;
        self.inner.fsblobs.remove_by_id(&target_id).await?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let from_components = parse_path(from)?;
        let to_components = parse_path(to)?;
        if from_components == to_components {
            return Ok(());
        }
        if from_components.is_empty() {
            return Err(FsError::InvalidOperation("cannot rename the root".into()));
        }
        if to_components.len() > from_components.len()
            && to_components[..from_components.len()] == from_components[..]
        {
            return Err(FsError::InvalidOperation(
                "cannot move a directory into itself".into(),
            ));
        }

        let (from_parent, from_name) = self.resolve_parent(from).await?;
        let (to_parent, to_name) = self.resolve_parent(to).await?;
        let (_guard_a, _guard_b) = self.inner.dir_locks.lock_pair(from_parent, to_parent).await;

        if from_parent == to_parent {
            let mut dir = self.load_dir(&from_parent).await?;
            let source_kind = dir.entry(from_name).ok_or(FsError::NotFound)?.kind;
            if let Some(target) = dir.entry(to_name) {
                let target_id = target.blob_id;
                self.check_rename_target(source_kind, target).await?;
                dir.remove_entry(to_name)?;
                self.remove_blob_or_defer(target_id).await?;
            }
            dir.rename_entry(from_name, to_name)?;
            dir.store().await
        } else {
            let mut from_dir = self.load_dir(&from_parent).await?;
            let mut to_dir = self.load_dir(&to_parent).await?;
            let mut entry = from_dir.remove_entry(from_name)?;
            if let Some(target) = to_dir.entry(to_name) {
                let target_id = target.blob_id;
                self.check_rename_target(entry.kind, target).await?;
                to_dir.remove_entry(to_name)?;
                self.remove_blob_or_defer(target_id).await?;
            }
            entry.name = to_name.to_string();
            entry.ctime = SystemTime::now();
            to_dir.add_entry(entry)?;
            to_dir.store().await?;
            from_dir.store().await
        }
    }

    /// POSIX target-overwrite rules: a directory may only replace an empty
    /// directory, a non-directory may not replace a directory.
    async fn check_rename_target(&self, source_kind: EntryKind, target: &DirEntry) -> FsResult<()> {
        match (source_kind, target.kind) {
            (EntryKind::Dir, EntryKind::Dir) => {
                let target_dir = self.load_dir(&target.blob_id).await?;
                if !target_dir.entries().is_empty() {
                    return Err(FsError::NotEmpty);
                }
                Ok(())
            }
            (EntryKind::Dir, _) => Err(FsError::NotADirectory),
            (_, EntryKind::Dir) => Err(FsError::IsADirectory),
            _ => Ok(()),
        }
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        dir.set_mode(name, mode)?;
        dir.store().await
    }

    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        dir.set_uid_gid(name, uid, gid)?;
        dir.store().await
    }

    pub async fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        dir.set_access_times(name, atime, mtime)?;
        dir.store().await
    }

    pub async fn truncate(&self, path: &str, new_size: u64) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path).await?;
        let _guard = self.inner.dir_locks.lock(parent).await;
        let mut dir = self.load_dir(&parent).await?;
        let entry = dir.entry(name).ok_or(FsError::NotFound)?;
        if entry.kind != EntryKind::File {
            return Err(FsError::IsADirectory);
        }
        let file = self
            .inner
            .fsblobs
            .load_existing(&entry.blob_id)
            .await?
            .into_file()?;
        file.resize(new_size).await?;
        dir.mark_modified(name)?;
        dir.store().await
    }

    /// Opens a file for I/O, registering the handle so unlink-while-open
    /// keeps the blob alive.
    pub async fn open_file(&self, path: &str) -> FsResult<OpenFile> {
        let (parent, name) = self.resolve_parent(path).await?;
        let dir = self.load_dir(&parent).await?;
        let entry = dir.entry(name).ok_or(FsError::NotFound)?;
        if entry.kind != EntryKind::File {
            return Err(FsError::IsADirectory);
        }
        let blob = self
            .inner
            .fsblobs
            .load_existing(&entry.blob_id)
            .await?
            .into_file()?;

        self.inner
            .open_files
            .lock()
            .unwrap()
            .entry(entry.blob_id)
            .or_default()
            .count += 1;

        Ok(OpenFile {
            inner: self.inner.clone(),
            blob: tokio::sync::Mutex::new(blob),
            blob_id: entry.blob_id,
            parent_id: parent,
            name: name.to_string(),
            released: false,
        })
    }

    pub async fn statfs(&self) -> FsResult<Statfs> {
        let used_blocks = self.inner.blocks.num_blocks().await?;
        let free_bytes = self.inner.blocks.estimate_free_bytes()?;
        let free_blocks = free_bytes / self.inner.block_size_bytes.max(1);
        Ok(Statfs {
            block_size: self.inner.block_size_bytes as u32,
            num_total_blocks: used_blocks + free_blocks,
            num_free_blocks: free_blocks,
            num_available_blocks: free_blocks,
            max_filename_length: MAX_NAME_LENGTH as u32,
        })
    }

    /// Writes all pending state through to the base store.
    pub async fn flush(&self) -> FsResult<()> {
        Ok(self.inner.blocks.flush_all().await?)
    }
}

/// An open file handle.
///
/// Reads and writes are serialized per handle-set through the blob lock.
/// Call [`OpenFile::close`] when done; dropping without closing falls back
/// to a best-effort asynchronous cleanup for deferred unlinks.
pub struct OpenFile {
    inner: Arc<DeviceInner>,
    blob: tokio::sync::Mutex<FileBlob>,
    blob_id: BlockId,
    parent_id: BlockId,
    name: String,
    released: bool,
}

impl OpenFile {
    pub async fn size(&self) -> FsResult<u64> {
        self.blob.lock().await.size().await
    }

    pub async fn read(&self, offset: u64, out: &mut [u8]) -> FsResult<usize> {
        let read = {
            let blob = self.blob.lock().await;
            blob.try_read(offset, out).await?
        };
        self.update_atime_after_read().await?;
        Ok(read)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> FsResult<()> {
        {
            let blob = self.blob.lock().await;
            blob.write(offset, data).await?;
        }
        self.mark_modified().await
    }

    pub async fn truncate(&self, new_size: u64) -> FsResult<()> {
        {
            let blob = self.blob.lock().await;
            blob.resize(new_size).await?;
        }
        self.mark_modified().await
    }

    /// Flushes the file content through to the base store.
    pub async fn fsync(&self) -> FsResult<()> {
        self.blob.lock().await.flush().await
    }

    async fn update_atime_after_read(&self) -> FsResult<()> {
        let behavior = self.inner.context.atime_behavior;
        let device = Device {
            inner: self.inner.clone(),
        };
        let _guard = self.inner.dir_locks.lock(self.parent_id).await;
        let mut dir = device.load_dir(&self.parent_id).await?;
        // The entry may be gone (unlinked or renamed while open).
        let Some(entry) = dir.entry(&self.name) else {
            return Ok(());
        };
        if behavior.should_update_atime_on_file_read(entry.atime, entry.mtime, entry.ctime) {
            dir.set_atime(&self.name, SystemTime::now())?;
            dir.store().await?;
        }
        Ok(())
    }

    async fn mark_modified(&self) -> FsResult<()> {
        let device = Device {
            inner: self.inner.clone(),
        };
        let _guard = self.inner.dir_locks.lock(self.parent_id).await;
        let mut dir = device.load_dir(&self.parent_id).await?;
        if dir.entry(&self.name).is_some() {
            dir.mark_modified(&self.name)?;
            dir.store().await?;
        }
        Ok(())
    }

    /// Flushes and releases the handle; completes a deferred unlink if
    /// this was the last handle on an unlinked file.
    pub async fn close(mut self) -> FsResult<()> {
        self.blob.lock().await.flush().await?;
        self.released = true;
        if self.inner.note_closed(self.blob_id) {
            self.inner.fsblobs.remove_by_id(&self.blob_id).await?;
        }
        Ok(())
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.inner.note_closed(self.blob_id) {
            let inner = self.inner.clone();
            let blob_id = self.blob_id;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = inner.fsblobs.remove_by_id(&blob_id).await {
                        warn!("failed to remove unlinked blob {blob_id}: {e}");
                    }
                });
            } else {
                warn!("leaking unlinked blob {blob_id}: no runtime for deferred removal");
            }
        }
    }
}
