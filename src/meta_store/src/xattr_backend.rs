use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dfs_lib::{Attributes, FsError, FsResult};
use fs2::FileExt;
use log::{debug, warn};

use crate::{AttrPredicate, MetadataBackend, UnlockHandle, LOCKFILE_SUFFIX};

/// Metadata backend storing attributes as extended attributes directly on
/// the node entry. Writers to one path are serialized by a sibling lockfile.
pub struct XattrBackend {
    max_retries: u32,
}

impl XattrBackend {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e)
                    if attempt < self.max_retries
                        && matches!(
                            e.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                        ) =>
                {
                    attempt += 1;
                    debug!("retrying xattr op after {}: attempt {}", e, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_all(&self, path: &Path, attrs: &Attributes) -> FsResult<()> {
        for (key, value) in attrs.iter() {
            self.with_retry(|| xattr::set(path, key, value))
                .map_err(|e| map_io(path, "set xattr", e))?;
        }
        Ok(())
    }
}

impl Default for XattrBackend {
    fn default() -> Self {
        Self::new(3)
    }
}

fn map_io(path: &Path, op: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.display().to_string()),
        _ => FsError::Io(format!("{} {}: {}", op, path.display(), e)),
    }
}

#[async_trait]
impl MetadataBackend for XattrBackend {
    async fn get(&self, path: &Path, key: &str) -> FsResult<Vec<u8>> {
        let value = self
            .with_retry(|| xattr::get(path, key))
            .map_err(|e| map_io(path, "get xattr", e))?;
        value.ok_or_else(|| FsError::NotFound(format!("{}: {}", path.display(), key)))
    }

    async fn get_all(&self, path: &Path) -> FsResult<Attributes> {
        let names = self
            .with_retry(|| xattr::list(path))
            .map_err(|e| map_io(path, "list xattrs", e))?;

        let mut attrs = Attributes::new();
        for name in names {
            let key = match name.to_str() {
                // Foreign attributes outside our namespace are not ours
                // to read or copy.
                Some(k) if k.starts_with(dfs_lib::ATTR_PREFIX) => k.to_string(),
                _ => continue,
            };
            match self.with_retry(|| xattr::get(path, &key)) {
                // Raced with a concurrent remove, skip.
                Ok(None) => continue,
                Ok(Some(value)) => attrs.set(key, value),
                Err(e) => return Err(map_io(path, "get xattr", e)),
            }
        }
        Ok(attrs)
    }

    async fn set(&self, path: &Path, key: &str, value: &[u8]) -> FsResult<()> {
        self.with_retry(|| xattr::set(path, key, value))
            .map_err(|e| map_io(path, "set xattr", e))
    }

    async fn set_many(&self, path: &Path, attrs: Attributes, acquire_lock: bool) -> FsResult<()> {
        if acquire_lock {
            let _guard = self.lock(path).await?;
            self.write_all(path, &attrs)
        } else {
            self.write_all(path, &attrs)
        }
    }

    async fn remove(&self, path: &Path, key: &str) -> FsResult<()> {
        match self.with_retry(|| xattr::remove(path, key)) {
            Ok(()) => Ok(()),
            // ENODATA: removing an absent attribute is not an error.
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(path, "remove xattr", e)),
        }
    }

    async fn copy_selected(
        &self,
        src: &Path,
        dst: &Path,
        predicate: AttrPredicate<'_>,
        source_locked: bool,
    ) -> FsResult<()> {
        let _guard = if source_locked {
            None
        } else {
            Some(self.lock(src).await?)
        };
        let attrs = self.get_all(src).await?;
        for (key, value) in attrs.iter() {
            if !predicate(key) {
                continue;
            }
            self.with_retry(|| xattr::set(dst, key, value))
                .map_err(|e| map_io(dst, "set xattr", e))?;
        }
        Ok(())
    }

    async fn lock(&self, path: &Path) -> FsResult<UnlockHandle> {
        let lockfile = self.lockfile_path(path);
        let lockfile_clone = lockfile.clone();
        let file = tokio::task::spawn_blocking(move || -> io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lockfile_clone)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| FsError::Internal(format!("lock task failed: {}", e)))?
        .map_err(|e| {
            warn!("lock {} failed: {}", lockfile.display(), e);
            map_io(&lockfile, "lock", e)
        })?;

        Ok(UnlockHandle::new(file, lockfile))
    }

    fn lockfile_path(&self, path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_os_string();
        os.push(LOCKFILE_SUFFIX);
        PathBuf::from(os)
    }
}
