use std::collections::HashMap;

use crate::{FsError, FsResult};

/// All engine attributes live in the user namespace under this prefix.
pub const ATTR_PREFIX: &str = "user.dfs.";

pub const ID_ATTR: &str = "user.dfs.id";
pub const PARENTID_ATTR: &str = "user.dfs.parentid";
pub const NAME_ATTR: &str = "user.dfs.name";
pub const TYPE_ATTR: &str = "user.dfs.type";
pub const MTIME_ATTR: &str = "user.dfs.mtime";
pub const BLOBID_ATTR: &str = "user.dfs.blobid";
pub const BLOBSIZE_ATTR: &str = "user.dfs.blobsize";
pub const STATUS_ATTR: &str = "user.dfs.status";
pub const PROPAGATION_ATTR: &str = "user.dfs.propagation";
pub const TREESIZE_ATTR: &str = "user.dfs.treesize";
pub const TREE_MTIME_ATTR: &str = "user.dfs.treemtime";
pub const REFERENCE_ATTR: &str = "user.dfs.reference";
pub const QUOTA_ATTR: &str = "user.dfs.quota";
pub const OWNER_ID_ATTR: &str = "user.dfs.owner.id";
pub const OWNER_IDP_ATTR: &str = "user.dfs.owner.idp";
pub const LOCK_ATTR: &str = "user.dfs.lock";
pub const TRASH_ORIGIN_ATTR: &str = "user.dfs.trash.origin";
pub const TRASH_DELETION_TIME_ATTR: &str = "user.dfs.trash.deletiontime";
pub const SCAN_STATUS_ATTR: &str = "user.dfs.scan.status";
pub const SCAN_DATE_ATTR: &str = "user.dfs.scan.date";

/// Checksums are stored per algorithm, e.g. `user.dfs.cs.sha256`.
pub const CHECKSUM_PREFIX: &str = "user.dfs.cs.";
/// One grant per principal, e.g. `user.dfs.grant.u:einstein`.
pub const GRANT_PREFIX: &str = "user.dfs.grant.";
/// Arbitrary client metadata, e.g. `user.dfs.md.favorite`.
pub const METADATA_PREFIX: &str = "user.dfs.md.";

/// Value of the status attribute while an upload awaits post-processing,
/// followed by the session id.
pub const PROCESSING_STATUS_PREFIX: &str = "processing:";
/// Propagation attribute value that terminates the ancestor climb.
pub const PROPAGATION_STOP: &str = "stop";

/// A set of named binary attributes read from or destined for a node entry.
#[derive(Debug, Clone, Default)]
pub struct Attributes(HashMap<String, Vec<u8>>);

impl Attributes {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Like `get_string` but missing keys are an inconsistency of the node.
    pub fn require_string(&self, key: &str) -> FsResult<String> {
        self.get_string(key)
            .ok_or_else(|| FsError::Inconsistent(format!("missing attribute {}", key)))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_string(key).and_then(|s| s.parse().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_string(key).and_then(|s| s.parse().ok())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.0.insert(key.into(), value);
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl AsRef<str>) {
        self.0
            .insert(key.into(), value.as_ref().as_bytes().to_vec());
    }

    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) {
        self.set_string(key, value.to_string());
    }

    pub fn set_u64(&mut self, key: impl Into<String>, value: u64) {
        self.set_string(key, value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: Attributes) {
        self.0.extend(other.0);
    }
}

impl From<HashMap<String, Vec<u8>>> for Attributes {
    fn from(map: HashMap<String, Vec<u8>>) -> Self {
        Self(map)
    }
}

impl IntoIterator for Attributes {
    type Item = (String, Vec<u8>);
    type IntoIter = std::collections::hash_map::IntoIter<String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
