//! File content as a blob: one magic byte, then the raw bytes.

use cryfs_blobs::{Blob, BlobStore};
use cryfs_core::BlockId;

use super::magic;
use crate::error::FsResult;

pub struct FileBlob {
    blob: Blob,
}

impl FileBlob {
    pub(super) async fn create(blobs: &BlobStore) -> FsResult<Self> {
        let blob = blobs.create().await?;
        blob.write(0, &[magic::FILE]).await?;
        Ok(Self { blob })
    }

    pub(super) fn from_blob(blob: Blob) -> Self {
        Self { blob }
    }

    pub fn id(&self) -> BlockId {
        self.blob.id()
    }

    pub async fn size(&self) -> FsResult<u64> {
        Ok(self.blob.size().await?.saturating_sub(1))
    }

    /// Short read at `offset` into the file content.
    pub async fn try_read(&self, offset: u64, out: &mut [u8]) -> FsResult<usize> {
        Ok(self.blob.try_read(offset + 1, out).await?)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> FsResult<()> {
        Ok(self.blob.write(offset + 1, data).await?)
    }

    pub async fn resize(&self, new_size: u64) -> FsResult<()> {
        Ok(self.blob.resize(new_size + 1).await?)
    }

    pub async fn flush(&self) -> FsResult<()> {
        Ok(self.blob.flush().await?)
    }
}
