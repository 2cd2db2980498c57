use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine configuration. Defaults suit a single-node deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Root directory for spaces, blobs, trash and upload state.
    pub root: PathBuf,
    /// Propagate tree mtimes up the ancestor chain.
    #[serde(default = "default_true")]
    pub tree_time_accounting: bool,
    /// Propagate tree sizes up the ancestor chain.
    #[serde(default = "default_true")]
    pub tree_size_accounting: bool,
    /// Skip version entries on overwrite.
    #[serde(default)]
    pub disable_versioning: bool,
    /// Number of parallel post-processing workers.
    #[serde(default = "default_workers")]
    pub postprocessing_workers: usize,
    /// Default quota in bytes for new spaces. None means unrestricted.
    #[serde(default)]
    pub default_quota_bytes: Option<u64>,
    /// Bounded retries for retryable I/O errnos.
    #[serde(default = "default_io_retries")]
    pub max_io_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    3
}

fn default_io_retries() -> u32 {
    3
}

impl Options {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tree_time_accounting: true,
            tree_size_accounting: true,
            disable_versioning: false,
            postprocessing_workers: default_workers(),
            default_quota_bytes: None,
            max_io_retries: default_io_retries(),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn spaces_dir(&self) -> PathBuf {
        self.root.join("spaces")
    }
}
