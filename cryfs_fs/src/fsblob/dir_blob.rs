//! Directory content as a blob: one magic byte, then the serialized entry
//! table.
//!
//! A `DirBlob` keeps the parsed entry vector in memory; mutations edit the
//! vector and [`DirBlob::store`] rewrites the whole blob. The device layer
//! serializes mutations per directory, so a `DirBlob` is always loaded,
//! mutated and stored under that directory's lock.

use std::time::SystemTime;

use cryfs_blobs::{Blob, BlobStore};
use cryfs_core::BlockId;

use super::dir_entries::{DirEntry, DirEntryList, EntryKind};
use super::magic;
use crate::error::{FsError, FsResult};

pub struct DirBlob {
    blob: Blob,
    entries: DirEntryList,
}

impl DirBlob {
    pub(super) async fn create(blobs: &BlobStore) -> FsResult<Self> {
        let blob = blobs.create().await?;
        blob.write(0, &[magic::DIR]).await?;
        Ok(Self {
            blob,
            entries: DirEntryList::new(),
        })
    }

    pub(super) async fn from_blob(blob: Blob) -> FsResult<Self> {
        let content = blob.read_all().await?;
        debug_assert_eq!(magic::DIR, content[0]);
        let entries = DirEntryList::deserialize(&content[1..])?;
        Ok(Self { blob, entries })
    }

    pub fn id(&self) -> BlockId {
        self.blob.id()
    }

    pub fn entries(&self) -> &DirEntryList {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    pub fn add_entry(&mut self, entry: DirEntry) -> FsResult<()> {
        self.entries.add(entry)
    }

    pub fn remove_entry(&mut self, name: &str) -> FsResult<DirEntry> {
        self.entries.remove(name)
    }

    pub fn rename_entry(&mut self, old_name: &str, new_name: &str) -> FsResult<()> {
        if self.entries.get(new_name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        self.entries.rename(old_name, new_name)
    }

    pub fn set_mode(&mut self, name: &str, mode: u32) -> FsResult<()> {
        let entry = self.entries.get_mut(name).ok_or(FsError::NotFound)?;
        entry.mode = mode;
        entry.ctime = SystemTime::now();
        Ok(())
    }

    pub fn set_uid_gid(&mut self, name: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let entry = self.entries.get_mut(name).ok_or(FsError::NotFound)?;
        if let Some(uid) = uid {
            entry.uid = uid;
        }
        if let Some(gid) = gid {
            entry.gid = gid;
        }
        entry.ctime = SystemTime::now();
        Ok(())
    }

    pub fn set_access_times(
        &mut self,
        name: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        let entry = self.entries.get_mut(name).ok_or(FsError::NotFound)?;
        if let Some(atime) = atime {
            entry.atime = atime;
        }
        if let Some(mtime) = mtime {
            entry.mtime = mtime;
            entry.ctime = SystemTime::now();
        }
        Ok(())
    }

    /// Bumps mtime and ctime after a content write.
    pub fn mark_modified(&mut self, name: &str) -> FsResult<()> {
        let entry = self.entries.get_mut(name).ok_or(FsError::NotFound)?;
        let now = SystemTime::now();
        entry.mtime = now;
        entry.ctime = now;
        Ok(())
    }

    pub fn set_atime(&mut self, name: &str, atime: SystemTime) -> FsResult<()> {
        let entry = self.entries.get_mut(name).ok_or(FsError::NotFound)?;
        entry.atime = atime;
        Ok(())
    }

    /// Writes the entry table back to the blob.
    pub async fn store(&self) -> FsResult<()> {
        let serialized = self.entries.serialize();
        let mut content = Vec::with_capacity(1 + serialized.len());
        content.push(magic::DIR);
        content.extend_from_slice(&serialized);
        self.blob.resize(content.len() as u64).await?;
        self.blob.write(0, &content).await?;
        Ok(())
    }

    pub async fn flush(&self) -> FsResult<()> {
        Ok(self.blob.flush().await?)
    }

    /// Directory entry kind helper for stat results.
    pub fn kind_of(&self, name: &str) -> Option<EntryKind> {
        self.entries.get(name).map(|e| e.kind)
    }
}
