use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use dfs_lib::{shard_id, shard_space_id, FsError, FsResult};
use log::warn;
use tokio::fs;
use tokio::io::AsyncRead;

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Immutable content store keyed by blob id. Content-independent; the
/// node carries the blob id and expected size.
#[async_trait]
pub trait Blobstore: Send + Sync {
    /// Move the content at `source` into the store.
    async fn upload(
        &self,
        space_id: &str,
        blob_id: &str,
        blob_size: u64,
        source: &Path,
    ) -> FsResult<()>;
    async fn download(&self, space_id: &str, blob_id: &str) -> FsResult<BlobReader>;
    async fn delete(&self, space_id: &str, blob_id: &str) -> FsResult<()>;
}

/// Blobs live under the owning space, sharded by blob id.
pub struct FsBlobstore {
    spaces_dir: PathBuf,
}

const BLOB_TMP_EXT: &str = "tmp";

impl FsBlobstore {
    pub fn new(spaces_dir: impl Into<PathBuf>) -> Self {
        Self {
            spaces_dir: spaces_dir.into(),
        }
    }

    fn blob_path(&self, space_id: &str, blob_id: &str) -> PathBuf {
        self.spaces_dir
            .join(shard_space_id(space_id))
            .join("blobs")
            .join(shard_id(blob_id))
    }
}

#[async_trait]
impl Blobstore for FsBlobstore {
    async fn upload(
        &self,
        space_id: &str,
        blob_id: &str,
        blob_size: u64,
        source: &Path,
    ) -> FsResult<()> {
        let final_path = self.blob_path(space_id, blob_id);
        let parent = final_path
            .parent()
            .ok_or_else(|| FsError::Internal(format!("no parent for {}", final_path.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| FsError::Io(format!("create blob dir: {}", e)))?;

        let mut tmp_os = final_path.as_os_str().to_os_string();
        tmp_os.push(".");
        tmp_os.push(BLOB_TMP_EXT);
        let tmp_path = PathBuf::from(tmp_os);
        let written = fs::copy(source, &tmp_path)
            .await
            .map_err(|e| FsError::Io(format!("write blob {}: {}", blob_id, e)))?;
        if written != blob_size {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FsError::Io(format!(
                "blob {} size mismatch: wrote {}, expected {}",
                blob_id, written, blob_size
            )));
        }

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| FsError::Io(format!("finalize blob {}: {}", blob_id, e)))
    }

    async fn download(&self, space_id: &str, blob_id: &str) -> FsResult<BlobReader> {
        let path = self.blob_path(space_id, blob_id);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::NotFound(format!("blob {}", blob_id))
            } else {
                warn!("open blob {} failed: {}", path.display(), e);
                FsError::Io(e.to_string())
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, space_id: &str, blob_id: &str) -> FsResult<()> {
        let path = self.blob_path(space_id, blob_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsError::NotFound(format!("blob {}", blob_id)))
            }
            Err(e) => Err(FsError::Io(format!("delete blob {}: {}", blob_id, e))),
        }
    }
}
