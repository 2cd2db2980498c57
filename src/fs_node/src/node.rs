use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dfs_lib::{
    calculate_etag, format_mtime, parse_mtime, Attributes, FsError, FsResult, NodeType,
    PermissionSet, ResourceId, User, BLOBID_ATTR, BLOBSIZE_ATTR, CHECKSUM_PREFIX,
    METADATA_PREFIX, MTIME_ATTR, NAME_ATTR, OWNER_IDP_ATTR, OWNER_ID_ATTR, PARENTID_ATTR,
    PROCESSING_STATUS_PREFIX, QUOTA_ATTR, REFERENCE_ATTR, SCAN_DATE_ATTR, SCAN_STATUS_ATTR,
    STATUS_ATTR, TREESIZE_ATTR, TYPE_ATTR,
};
use log::error;

use crate::locks::LockInfo;
use crate::lookup::Lookup;

/// In-memory handle for a stored entity. Carries identity and parent
/// linkage; everything else is read from the entry's attributes on
/// demand. A handle may refer to a node that does not exist yet, with
/// the parent and name already set.
#[derive(Clone)]
pub struct Node {
    pub space_id: String,
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub blob_id: Option<String>,
    pub blob_size: u64,
    pub exists: bool,
    lookup: Lookup,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("space_id", &self.space_id)
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("exists", &self.exists)
            .finish()
    }
}

/// Client-facing view of a node.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub parent_id: String,
    pub name: String,
    pub path: String,
    pub node_type: NodeType,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub etag: String,
    pub checksums: HashMap<String, String>,
    pub arbitrary_metadata: HashMap<String, String>,
    pub permissions: PermissionSet,
    pub lock: Option<LockInfo>,
    pub space_root: bool,
    pub reference_target: Option<String>,
}

impl Node {
    pub fn new(
        lookup: Lookup,
        space_id: impl Into<String>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
        node_type: NodeType,
        blob_size: u64,
    ) -> Self {
        Self {
            space_id: space_id.into(),
            id: id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            node_type,
            blob_id: None,
            blob_size,
            exists: false,
            lookup,
        }
    }

    /// Read a node by id. A missing entry yields a non-existing handle;
    /// an entry without its identity attributes is inconsistent.
    pub async fn read_node(lookup: Lookup, space_id: &str, node_id: &str) -> FsResult<Node> {
        let path = lookup.internal_path(space_id, node_id);
        let attrs = match lookup.backend().get_all(&path).await {
            Ok(attrs) if !attrs.is_empty() => attrs,
            Ok(_) | Err(FsError::NotFound(_)) => {
                return Ok(Node {
                    space_id: space_id.to_string(),
                    id: node_id.to_string(),
                    parent_id: String::new(),
                    name: String::new(),
                    node_type: NodeType::File,
                    blob_id: None,
                    blob_size: 0,
                    exists: false,
                    lookup,
                });
            }
            Err(e) => return Err(e),
        };

        Self::from_attrs(lookup, space_id, node_id, &attrs)
    }

    fn from_attrs(
        lookup: Lookup,
        space_id: &str,
        node_id: &str,
        attrs: &Attributes,
    ) -> FsResult<Node> {
        let node_type = NodeType::from_attr(&attrs.require_string(TYPE_ATTR).map_err(|e| {
            error!("node {}/{} has no type attribute", space_id, node_id);
            e
        })?)?;
        Ok(Node {
            space_id: space_id.to_string(),
            id: node_id.to_string(),
            parent_id: attrs.require_string(PARENTID_ATTR)?,
            name: attrs.require_string(NAME_ATTR)?,
            node_type,
            blob_id: attrs.get_string(BLOBID_ATTR),
            blob_size: attrs.get_u64(BLOBSIZE_ATTR).unwrap_or(0),
            exists: true,
            lookup,
        })
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub fn internal_path(&self) -> PathBuf {
        self.lookup.internal_path(&self.space_id, &self.id)
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.space_id.clone(), self.id.clone())
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }

    pub fn is_space_root(&self) -> bool {
        self.id == self.space_id
    }

    pub async fn space_root(&self) -> FsResult<Node> {
        let root = Node::read_node(self.lookup.clone(), &self.space_id, &self.space_id).await?;
        if !root.exists {
            return Err(FsError::NotFound(format!("space {}", self.space_id)));
        }
        Ok(root)
    }

    /// Resolve a child by name. Returns a non-existing handle with the
    /// parent set when there is no such entry.
    pub async fn child(&self, name: &str) -> FsResult<Node> {
        let link = self.internal_path().join(name);
        let target = match tokio::fs::read_link(&link).await {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Node::new(
                    self.lookup.clone(),
                    self.space_id.clone(),
                    String::new(),
                    self.id.clone(),
                    name.to_string(),
                    NodeType::File,
                    0,
                ));
            }
            Err(e) => return Err(FsError::Io(format!("readlink {}: {}", link.display(), e))),
        };

        let child_id = Lookup::node_id_from_link(&target)?;
        Node::read_node(self.lookup.clone(), &self.space_id, &child_id).await
    }

    // ---- metadata ----

    /// Read selected attributes; missing keys are simply absent from the
    /// result.
    pub async fn read_metadata(&self, keys: &[&str]) -> FsResult<Attributes> {
        let mut out = Attributes::new();
        for key in keys {
            match self.lookup.backend().get(&self.internal_path(), key).await {
                Ok(value) => out.set(key.to_string(), value),
                Err(FsError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub async fn set_metadata(&self, attrs: Attributes) -> FsResult<()> {
        self.lookup
            .backend()
            .set_many(&self.internal_path(), attrs, true)
            .await
    }

    pub async fn set_metadata_key(&self, key: &str, value: impl AsRef<[u8]>) -> FsResult<()> {
        self.lookup
            .backend()
            .set(&self.internal_path(), key, value.as_ref())
            .await
    }

    pub async fn remove_metadata_key(&self, key: &str) -> FsResult<()> {
        self.lookup
            .backend()
            .remove(&self.internal_path(), key)
            .await
    }

    /// Set client-supplied arbitrary metadata, namespaced away from the
    /// engine's own attributes.
    pub async fn set_arbitrary_metadata(&self, md: &HashMap<String, String>) -> FsResult<()> {
        let mut attrs = Attributes::new();
        for (key, value) in md {
            attrs.set_string(format!("{}{}", METADATA_PREFIX, key), value);
        }
        self.set_metadata(attrs).await
    }

    pub async fn get_mtime(&self) -> FsResult<DateTime<Utc>> {
        let raw = self
            .lookup
            .backend()
            .get(&self.internal_path(), MTIME_ATTR)
            .await
            .map_err(|e| match e {
                FsError::NotFound(_) => {
                    FsError::Inconsistent(format!("node {} has no mtime", self.id))
                }
                other => other,
            })?;
        parse_mtime(&String::from_utf8_lossy(&raw))
            .map_err(|e| FsError::Inconsistent(format!("node {}: {}", self.id, e)))
    }

    pub async fn set_mtime(&self, mtime: &DateTime<Utc>) -> FsResult<()> {
        self.set_metadata_key(MTIME_ATTR, format_mtime(mtime))
            .await
    }

    pub async fn etag(&self) -> FsResult<String> {
        Ok(calculate_etag(&self.id, &self.get_mtime().await?))
    }

    // ---- processing status ----

    pub async fn is_processing(&self) -> bool {
        match self
            .lookup
            .backend()
            .get(&self.internal_path(), STATUS_ATTR)
            .await
        {
            Ok(raw) => String::from_utf8_lossy(&raw).starts_with(PROCESSING_STATUS_PREFIX),
            Err(_) => false,
        }
    }

    pub async fn mark_processing(&self, session_id: &str) -> FsResult<()> {
        self.set_metadata_key(
            STATUS_ATTR,
            format!("{}{}", PROCESSING_STATUS_PREFIX, session_id),
        )
        .await
    }

    /// Clear the processing status, but only for the session that set it.
    pub async fn unmark_processing(&self, session_id: &str) -> FsResult<()> {
        let current = match self
            .lookup
            .backend()
            .get(&self.internal_path(), STATUS_ATTR)
            .await
        {
            Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
            Err(FsError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let expected = format!("{}{}", PROCESSING_STATUS_PREFIX, session_id);
        if current != expected {
            return Err(FsError::Aborted(format!(
                "processing status of {} held by another session",
                self.id
            )));
        }
        self.remove_metadata_key(STATUS_ATTR).await
    }

    pub async fn set_scan_data(&self, description: &str, scandate: &DateTime<Utc>) -> FsResult<()> {
        let mut attrs = Attributes::new();
        attrs.set_string(SCAN_STATUS_ATTR, description);
        attrs.set_string(SCAN_DATE_ATTR, format_mtime(scandate));
        self.set_metadata(attrs).await
    }

    // ---- owner & quota ----

    pub async fn owner(&self) -> FsResult<Option<User>> {
        let root = if self.is_space_root() {
            self.clone()
        } else {
            self.space_root().await?
        };
        let attrs = root
            .read_metadata(&[OWNER_ID_ATTR, OWNER_IDP_ATTR])
            .await?;
        Ok(attrs.get_string(OWNER_ID_ATTR).map(|id| User {
            id,
            idp: attrs.get_string(OWNER_IDP_ATTR).unwrap_or_default(),
            ..Default::default()
        }))
    }

    /// Reject a write that would push the space above its quota. Returns
    /// the used and total bytes for callers that report them.
    pub async fn check_quota(
        space_root: &Node,
        has_old_size: bool,
        old_size: u64,
        new_size: u64,
    ) -> FsResult<(u64, Option<u64>)> {
        let attrs = space_root
            .read_metadata(&[QUOTA_ATTR, TREESIZE_ATTR])
            .await?;
        let used = attrs.get_u64(TREESIZE_ATTR).unwrap_or(0);
        let quota = attrs.get_u64(QUOTA_ATTR);
        if let Some(total) = quota {
            let old = if has_old_size { old_size } else { 0 };
            let projected = used.saturating_sub(old).saturating_add(new_size);
            if projected > total {
                return Err(FsError::InsufficientStorage(format!(
                    "space {}: {} of {} bytes used, write of {} rejected",
                    space_root.space_id, used, total, new_size
                )));
            }
        }
        Ok((used, quota))
    }

    // ---- resource info ----

    pub async fn as_resource_info(
        &self,
        permissions: &PermissionSet,
        relative: bool,
    ) -> FsResult<ResourceInfo> {
        let attrs = self
            .lookup
            .backend()
            .get_all(&self.internal_path())
            .await?;
        let mtime = parse_mtime(&attrs.require_string(MTIME_ATTR)?)?;

        let size = if self.is_dir() {
            attrs.get_u64(TREESIZE_ATTR).unwrap_or(0)
        } else {
            self.blob_size
        };

        let mut checksums = HashMap::new();
        let mut arbitrary_metadata = HashMap::new();
        for (key, value) in attrs.iter() {
            if let Some(algo) = key.strip_prefix(CHECKSUM_PREFIX) {
                checksums.insert(algo.to_string(), String::from_utf8_lossy(value).into_owned());
            } else if let Some(md_key) = key.strip_prefix(METADATA_PREFIX) {
                arbitrary_metadata.insert(
                    md_key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }

        let path = if relative {
            format!("./{}", self.name)
        } else {
            self.lookup.path(self).await?
        };

        Ok(ResourceInfo {
            id: self.resource_id(),
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
            path,
            node_type: self.node_type,
            size,
            mtime,
            etag: calculate_etag(&self.id, &mtime),
            checksums,
            arbitrary_metadata,
            permissions: *permissions,
            lock: self.read_lock().await?,
            space_root: self.is_space_root(),
            reference_target: attrs.get_string(REFERENCE_ATTR),
        })
    }
}

/// Names that can be linked into a directory entry. Everything else is
/// reserved for the engine.
pub fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArg(format!("invalid node name: {:?}", name)));
    }
    if name.ends_with(meta_store::LOCKFILE_SUFFIX) {
        return Err(FsError::InvalidArg(format!("reserved node name: {:?}", name)));
    }
    Ok(())
}
