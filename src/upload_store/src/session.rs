use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dfs_lib::{FsError, FsResult, User};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// Session metadata key recording the signed byte delta the commit will
/// propagate.
pub const META_SIZE_DIFF: &str = "sizeDiff";
/// Session metadata key recording the version entry created for an
/// overwritten node.
pub const META_VERSIONS_PATH: &str = "versionsPath";

/// Client preconditions captured at initiation and enforced at commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadHeaders {
    #[serde(default)]
    pub if_match: Option<String>,
    #[serde(default)]
    pub if_none_match: Option<String>,
    #[serde(default)]
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

/// The persisted `.info` record of an upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub space_id: String,
    /// Target node id, allocated at initiation.
    pub node_id: String,
    pub parent_id: String,
    pub filename: String,
    pub declared_size: u64,
    /// Whether the target existed when the session was initiated.
    #[serde(default)]
    pub node_exists: bool,
    /// Client-requested mtime override.
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub headers: UploadHeaders,
    /// Blob id allocated during pre-commit.
    #[serde(default)]
    pub blob_id: Option<String>,
    #[serde(default)]
    pub executing_user: User,
    /// Lock id the initiating request carried, replayed on commit.
    #[serde(default)]
    pub lock_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// An in-progress upload: the persisted record plus the chunk buffer.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub record: SessionRecord,
    /// Bytes received so far, derived from the chunk bin length.
    pub offset: u64,
    uploads_dir: PathBuf,
}

impl UploadSession {
    pub(crate) fn new(uploads_dir: PathBuf, record: SessionRecord) -> Self {
        Self {
            record,
            offset: 0,
            uploads_dir,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.session_id
    }

    pub fn info_path(&self) -> PathBuf {
        self.uploads_dir
            .join(format!("{}.info", self.record.session_id))
    }

    pub fn bin_path(&self) -> PathBuf {
        self.uploads_dir
            .join(format!("{}.bin", self.record.session_id))
    }

    pub fn size_diff(&self) -> i64 {
        self.record
            .metadata
            .get(META_SIZE_DIFF)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub(crate) fn set_size_diff(&mut self, diff: i64) {
        self.record
            .metadata
            .insert(META_SIZE_DIFF.to_string(), diff.to_string());
    }

    pub fn versions_path(&self) -> Option<PathBuf> {
        self.record
            .metadata
            .get(META_VERSIONS_PATH)
            .map(PathBuf::from)
    }

    pub(crate) fn set_versions_path(&mut self, path: &std::path::Path) {
        self.record.metadata.insert(
            META_VERSIONS_PATH.to_string(),
            path.display().to_string(),
        );
    }

    /// Write the `.info` record. Called at initiation and after every
    /// state change so a restart can recover the session.
    pub async fn persist(&self) -> FsResult<()> {
        let json = serde_json::to_vec_pretty(&self.record)
            .map_err(|e| FsError::Internal(format!("encode session: {}", e)))?;
        tokio::fs::write(self.info_path(), json)
            .await
            .map_err(|e| FsError::Io(format!("persist session {}: {}", self.id(), e)))
    }

    /// Append a chunk to the bin and return the new offset.
    pub async fn append_chunk<R>(&mut self, reader: &mut R) -> FsResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut bin = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bin_path())
            .await
            .map_err(|e| FsError::Io(format!("open chunk bin {}: {}", self.id(), e)))?;
        tokio::io::copy(reader, &mut bin)
            .await
            .map_err(|e| FsError::Io(format!("write chunk {}: {}", self.id(), e)))?;
        let len = bin
            .metadata()
            .await
            .map_err(|e| FsError::Io(format!("stat chunk bin {}: {}", self.id(), e)))?
            .len();
        if len > self.record.declared_size {
            return Err(FsError::InvalidArg(format!(
                "upload {} exceeds declared size {}",
                self.id(),
                self.record.declared_size
            )));
        }
        self.offset = len;
        Ok(len)
    }

    pub(crate) async fn create_bin(&self) -> FsResult<()> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.bin_path())
            .await
            .map_err(|e| FsError::Io(format!("create chunk bin {}: {}", self.id(), e)))?;
        Ok(())
    }

    pub(crate) async fn remove_files(&self, bin: bool, info: bool) {
        if bin {
            if let Err(e) = tokio::fs::remove_file(self.bin_path()).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("remove chunk bin {}: {}", self.id(), e);
                }
            }
        }
        if info {
            if let Err(e) = tokio::fs::remove_file(self.info_path()).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("remove session record {}: {}", self.id(), e);
                }
            }
        }
    }
}
