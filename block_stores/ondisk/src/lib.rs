//! On-disk block store: one regular file per block.
//!
//! A block with hex id `0123abcd…` lives at `<basedir>/012/3abcd…`. Each
//! file starts with a fixed 4-byte format version header followed by the
//! payload. Writes go to a temp file in the same shard directory and become
//! visible atomically, so a crashed write leaves no partially-written block.

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use cryfs_core::{
    BlockId, BlockStore, BlockStoreError, BlockStoreResult, RemoveResult, TryCreateResult,
    store::BlockIdStream,
};

/// Current on-disk format, written as u32 LE at the start of every block file.
const FORMAT_VERSION: u32 = 0;
const FORMAT_HEADER_SIZE: usize = 4;

/// Number of leading hex characters used as the shard directory name.
const PREFIX_LEN: usize = 3;

#[derive(Debug)]
pub struct OnDiskBlockStore {
    base_path: PathBuf,
}

impl OnDiskBlockStore {
    /// Uses `base_path` as the block directory. The caller has already
    /// validated that it exists and is accessible.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn block_path(&self, id: &BlockId) -> PathBuf {
        let hex = id.to_hex();
        self.base_path.join(&hex[..PREFIX_LEN]).join(&hex[PREFIX_LEN..])
    }

    fn encode(&self, data: &[u8]) -> Bytes {
        let mut file_content = BytesMut::with_capacity(FORMAT_HEADER_SIZE + data.len());
        file_content.put_u32_le(FORMAT_VERSION);
        file_content.put_slice(data);
        file_content.freeze()
    }

    fn decode(&self, id: &BlockId, file_content: &[u8]) -> BlockStoreResult<Bytes> {
        if file_content.len() < FORMAT_HEADER_SIZE {
            return Err(BlockStoreError::corrupted(*id, "file too small for header"));
        }
        let version = u32::from_le_bytes(file_content[..FORMAT_HEADER_SIZE].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(BlockStoreError::corrupted(
                *id,
                format!("unknown format version {version}"),
            ));
        }
        Ok(Bytes::copy_from_slice(&file_content[FORMAT_HEADER_SIZE..]))
    }

    /// Writes `file_content` to a temp file in the same shard directory and
    /// publishes it at `path`. With `replace`, an existing block is
    /// overwritten; without, an existing block wins and the write is
    /// discarded.
    async fn write_atomically(
        &self,
        path: &Path,
        file_content: Bytes,
        replace: bool,
    ) -> BlockStoreResult<bool> {
        let dir = path.parent().expect("block path always has a shard dir");
        tokio::fs::create_dir_all(dir).await.map_err(map_enospc)?;

        let tmp_path = dir.join(format!(
            ".tmp.{}.{}",
            std::process::id(),
            BlockId::new_random().fmt_short()
        ));
        tokio::fs::write(&tmp_path, &file_content)
            .await
            .map_err(map_enospc)?;

        if replace {
            tokio::fs::rename(&tmp_path, path).await.map_err(map_enospc)?;
            Ok(true)
        } else {
            // hard_link fails if the target exists, giving atomic
            // create-new semantics; exactly one concurrent creator wins.
            let result = tokio::fs::hard_link(&tmp_path, path).await;
            let _ = tokio::fs::remove_file(&tmp_path).await;
            match result {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(map_enospc(e)),
            }
        }
    }
}

fn map_enospc(e: io::Error) -> BlockStoreError {
    if e.raw_os_error() == Some(libc::ENOSPC) {
        BlockStoreError::OutOfSpace
    } else {
        BlockStoreError::Io(e)
    }
}

fn parse_block_path(base: &Path, path: &Path) -> Option<BlockId> {
    let rest = path.strip_prefix(base).ok()?;
    let mut components = rest.components();
    let prefix = components.next()?.as_os_str().to_str()?;
    let suffix = components.next()?.as_os_str().to_str()?;
    if components.next().is_some() || prefix.len() != PREFIX_LEN {
        return None;
    }
    BlockId::from_hex(&format!("{prefix}{suffix}")).ok()
}

#[async_trait::async_trait]
impl BlockStore for OnDiskBlockStore {
    async fn try_create(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<TryCreateResult> {
        let path = self.block_path(id);
        let created = self
            .write_atomically(&path, self.encode(&data), false)
            .await?;
        if created {
            Ok(TryCreateResult::Created)
        } else {
            Ok(TryCreateResult::AlreadyExists)
        }
    }

    async fn overwrite(&self, id: &BlockId, data: Bytes) -> BlockStoreResult<()> {
        let path = self.block_path(id);
        self.write_atomically(&path, self.encode(&data), true).await?;
        Ok(())
    }

    async fn load(&self, id: &BlockId) -> BlockStoreResult<Option<Bytes>> {
        let path = self.block_path(id);
        match tokio::fs::read(&path).await {
            Ok(file_content) => Ok(Some(self.decode(id, &file_content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &BlockId) -> BlockStoreResult<RemoveResult> {
        let path = self.block_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                // Drop the shard directory if this was its last block.
                if let Some(dir) = path.parent() {
                    let _ = tokio::fs::remove_dir(dir).await;
                }
                Ok(RemoveResult::Removed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Ok(RemoveResult::NotRemovedBecauseItDoesntExist)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn num_blocks(&self) -> BlockStoreResult<u64> {
        let mut count = 0u64;
        for entry in walkdir::WalkDir::new(&self.base_path).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| BlockStoreError::Io(e.into()))?;
            if entry.file_type().is_file()
                && parse_block_path(&self.base_path, entry.path()).is_some()
            {
                count += 1;
            }
        }
        Ok(count)
    }

    fn estimate_free_bytes(&self) -> BlockStoreResult<u64> {
        let path = CString::new(self.base_path.as_os_str().as_bytes())
            .map_err(|_| BlockStoreError::Io(io::Error::other("base path contains NUL")))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn block_size_from_physical(&self, physical: u64) -> u64 {
        physical.saturating_sub(FORMAT_HEADER_SIZE as u64)
    }

    async fn block_ids(&self) -> BlockStoreResult<BlockIdStream> {
        let mut ids = Vec::new();
        for entry in walkdir::WalkDir::new(&self.base_path).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| BlockStoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(id) = parse_block_path(&self.base_path, entry.path()) {
                ids.push(Ok(id));
            }
        }
        Ok(Box::new(stream::iter(ids)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryfs_core::testutil::{BlockStoreTests, random_bytes};

    #[tokio::test]
    async fn store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        BlockStoreTests::new(&store).run_all().await.unwrap();
    }

    #[tokio::test]
    async fn block_file_is_sharded_by_hex_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        let id = BlockId::from_hex("0123456789abcdef0123456789abcdef").unwrap();
        store.try_create(&id, random_bytes(10)).await.unwrap();
        assert!(
            dir.path()
                .join("012")
                .join("3456789abcdef0123456789abcdef")
                .is_file()
        );
    }

    #[tokio::test]
    async fn file_starts_with_format_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        let id = store.create_block_id();
        store
            .try_create(&id, Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let raw = std::fs::read(store.block_path(&id)).unwrap();
        assert_eq!(&[0, 0, 0, 0], &raw[..4]);
        assert_eq!(b"payload", &raw[4..]);
    }

    #[tokio::test]
    async fn load_rejects_unknown_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(10)).await.unwrap();

        let path = store.block_path(&id);
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] = 99;
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(BlockStoreError::CorruptedBlock { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(10)).await.unwrap();
        std::fs::write(store.block_path(&id), [0u8; 2]).unwrap();

        assert!(matches!(
            store.load(&id).await,
            Err(BlockStoreError::CorruptedBlock { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_files_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = OnDiskBlockStore::new(dir.path());
        let id = store.create_block_id();
        store.try_create(&id, random_bytes(10)).await.unwrap();
        std::fs::write(dir.path().join("cryfs.config"), b"not a block").unwrap();

        assert_eq!(1, store.num_blocks().await.unwrap());
    }

    #[test]
    fn physical_size_subtracts_header() {
        let store = OnDiskBlockStore::new("/nonexistent");
        assert_eq!(32764, store.block_size_from_physical(32768));
    }
}
