mod blob_store;
mod xattr_backend;

#[cfg(test)]
mod xattr_backend_tests;

pub use blob_store::{BlobReader, Blobstore, FsBlobstore};
pub use xattr_backend::XattrBackend;

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dfs_lib::{Attributes, FsResult};
use log::warn;

/// Suffix of the sibling lockfile that serializes metadata writers.
pub const LOCKFILE_SUFFIX: &str = ".mlock";

/// Predicate deciding which attributes `copy_selected` carries over.
pub type AttrPredicate<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Atomic read/write of named binary attributes on an internal path, plus a
/// cross-process exclusive lock keyed by a lockfile derived from that path.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    async fn get(&self, path: &Path, key: &str) -> FsResult<Vec<u8>>;
    async fn get_all(&self, path: &Path) -> FsResult<Attributes>;
    async fn set(&self, path: &Path, key: &str, value: &[u8]) -> FsResult<()>;
    /// Write a full attribute set. With `acquire_lock` the write happens
    /// under the path's metadata lock, otherwise the caller already holds it.
    async fn set_many(&self, path: &Path, attrs: Attributes, acquire_lock: bool) -> FsResult<()>;
    async fn remove(&self, path: &Path, key: &str) -> FsResult<()>;
    /// Copy the attributes selected by `predicate` from `src` to `dst`.
    /// The write lock on `src` is held for the duration; pass
    /// `source_locked` when the caller already holds it.
    async fn copy_selected(
        &self,
        src: &Path,
        dst: &Path,
        predicate: AttrPredicate<'_>,
        source_locked: bool,
    ) -> FsResult<()>;
    /// Acquire the exclusive advisory lock for `path`.
    async fn lock(&self, path: &Path) -> FsResult<UnlockHandle>;
    fn lockfile_path(&self, path: &Path) -> PathBuf;
}

/// Held metadata lock. Releases the flock on drop. The lockfile itself
/// stays on disk: unlinking it here would hand a parked waiter the old
/// inode while the next acquirer creates and locks a fresh one, and the
/// two would no longer exclude each other.
pub struct UnlockHandle {
    file: Option<File>,
    lockfile: PathBuf,
}

impl UnlockHandle {
    pub(crate) fn new(file: File, lockfile: PathBuf) -> Self {
        Self {
            file: Some(file),
            lockfile,
        }
    }
}

impl Drop for UnlockHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                warn!("unlock {} failed: {}", self.lockfile.display(), e);
            }
        }
    }
}
