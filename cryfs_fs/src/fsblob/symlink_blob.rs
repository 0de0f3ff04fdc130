//! Symlink targets as blobs: one magic byte, then the UTF-8 target path.

use cryfs_blobs::{Blob, BlobStore};
use cryfs_core::BlockId;

use super::magic;
use crate::error::{FsError, FsResult};

pub struct SymlinkBlob {
    blob: Blob,
}

impl SymlinkBlob {
    /// The target is written once at creation and never changes; POSIX has
    /// no symlink-retargeting operation.
    pub(super) async fn create(blobs: &BlobStore, target: &str) -> FsResult<Self> {
        let blob = blobs.create().await?;
        let mut content = Vec::with_capacity(1 + target.len());
        content.push(magic::SYMLINK);
        content.extend_from_slice(target.as_bytes());
        blob.write(0, &content).await?;
        Ok(Self { blob })
    }

    pub(super) fn from_blob(blob: Blob) -> Self {
        Self { blob }
    }

    pub fn id(&self) -> BlockId {
        self.blob.id()
    }

    pub async fn target(&self) -> FsResult<String> {
        let content = self.blob.read_all().await?;
        String::from_utf8(content[1..].to_vec())
            .map_err(|_| FsError::Io(format!("symlink {} target is not UTF-8", self.id())))
    }

    pub async fn flush(&self) -> FsResult<()> {
        Ok(self.blob.flush().await?)
    }
}
