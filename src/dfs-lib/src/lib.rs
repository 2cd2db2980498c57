mod attrs;
mod cache;
mod events;
mod options;
mod perms;
mod reference;
mod tools;

pub use attrs::*;
pub use cache::*;
pub use events::*;
pub use options::*;
pub use perms::*;
pub use reference::*;
pub use tools::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("locked by {0}")]
    Locked(String),
    #[error("inconsistent node: {0}")]
    Inconsistent(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, FsError::Aborted(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, FsError::Locked(_))
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(err.to_string()),
            std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied(err.to_string()),
            _ => FsError::Io(err.to_string()),
        }
    }
}
