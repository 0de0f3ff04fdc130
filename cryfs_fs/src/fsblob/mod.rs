//! Kind-typed blobs: the first byte of every filesystem blob is a magic
//! marking it as a file, directory or symlink; the payload after it is
//! kind-specific.

pub mod dir_blob;
pub mod dir_entries;
pub mod file_blob;
pub mod symlink_blob;

use cryfs_blobs::BlobStore;
use cryfs_core::BlockId;

use crate::error::{FsError, FsResult};
pub use dir_blob::DirBlob;
pub use file_blob::FileBlob;
pub use symlink_blob::SymlinkBlob;

pub(crate) mod magic {
    pub const FILE: u8 = 0x00;
    pub const DIR: u8 = 0x01;
    pub const SYMLINK: u8 = 0x02;
}

/// A blob dispatched on its kind magic.
pub enum FsBlob {
    File(FileBlob),
    Dir(DirBlob),
    Symlink(SymlinkBlob),
}

impl FsBlob {
    pub fn id(&self) -> BlockId {
        match self {
            Self::File(blob) => blob.id(),
            Self::Dir(blob) => blob.id(),
            Self::Symlink(blob) => blob.id(),
        }
    }

    pub fn into_dir(self) -> FsResult<DirBlob> {
        match self {
            Self::Dir(blob) => Ok(blob),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub fn into_file(self) -> FsResult<FileBlob> {
        match self {
            Self::File(blob) => Ok(blob),
            Self::Dir(_) => Err(FsError::IsADirectory),
            Self::Symlink(_) => Err(FsError::InvalidOperation("not a regular file".into())),
        }
    }

    pub fn into_symlink(self) -> FsResult<SymlinkBlob> {
        match self {
            Self::Symlink(blob) => Ok(blob),
            _ => Err(FsError::InvalidOperation("not a symlink".into())),
        }
    }
}

/// Creates and loads kind-typed blobs.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    blobs: BlobStore,
}

impl FsBlobStore {
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    pub async fn create_file_blob(&self) -> FsResult<FileBlob> {
        FileBlob::create(&self.blobs).await
    }

    pub async fn create_dir_blob(&self) -> FsResult<DirBlob> {
        DirBlob::create(&self.blobs).await
    }

    pub async fn create_symlink_blob(&self, target: &str) -> FsResult<SymlinkBlob> {
        SymlinkBlob::create(&self.blobs, target).await
    }

    /// Loads a blob and dispatches on its magic byte.
    pub async fn load(&self, id: &BlockId) -> FsResult<Option<FsBlob>> {
        let Some(blob) = self.blobs.open(id).await? else {
            return Ok(None);
        };
        let mut magic_byte = [0u8; 1];
        if blob.try_read(0, &mut magic_byte).await? != 1 {
            return Err(FsError::Io(format!("blob {id} is empty")));
        }
        match magic_byte[0] {
            magic::FILE => Ok(Some(FsBlob::File(FileBlob::from_blob(blob)))),
            magic::DIR => Ok(Some(FsBlob::Dir(DirBlob::from_blob(blob).await?))),
            magic::SYMLINK => Ok(Some(FsBlob::Symlink(SymlinkBlob::from_blob(blob)))),
            other => Err(FsError::Io(format!(
                "blob {id} has unknown kind magic {other:#x}"
            ))),
        }
    }

    /// Loads a blob that must exist.
    pub async fn load_existing(&self, id: &BlockId) -> FsResult<FsBlob> {
        self.load(id)
            .await?
            .ok_or_else(|| FsError::Io(format!("blob {id} is missing")))
    }

    /// Removes a blob and all its blocks.
    pub async fn remove_by_id(&self, id: &BlockId) -> FsResult<()> {
        self.blobs.remove_by_id(id).await?;
        Ok(())
    }

    pub async fn num_nodes(&self) -> FsResult<u64> {
        Ok(self.blobs.num_nodes().await?)
    }

    pub fn estimate_space_for_num_blocks_left(&self) -> FsResult<u64> {
        Ok(self.blobs.estimate_space_for_num_blocks_left()?)
    }

    pub fn virtual_block_size_bytes(&self) -> u64 {
        self.blobs.virtual_block_size_bytes()
    }
}
