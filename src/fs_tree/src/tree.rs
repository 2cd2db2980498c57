use std::sync::Arc;

use chrono::{DateTime, Utc};
use dfs_lib::{
    format_mtime, parse_mtime, Attributes, FsError, FsResult, NodeType, Options, RequestContext,
    User, ID_ATTR, MTIME_ATTR, NAME_ATTR, OWNER_IDP_ATTR, OWNER_ID_ATTR, PARENTID_ATTR,
    PROPAGATION_ATTR, PROPAGATION_STOP, QUOTA_ATTR, REFERENCE_ATTR, TREESIZE_ATTR,
    TREE_MTIME_ATTR, TYPE_ATTR,
};
use fs_node::{validate_name, Lookup, Node};
use log::{debug, error, warn};
use meta_store::{BlobReader, Blobstore};
use uuid::Uuid;

/// Owns all structural mutations of the node tree: the on-disk directory
/// structure, the symlink-by-id child links, trash and aggregate
/// propagation.
pub struct Tree {
    pub(crate) lookup: Lookup,
    pub(crate) blobstore: Arc<dyn Blobstore>,
    pub(crate) options: Options,
}

impl Tree {
    pub fn new(lookup: Lookup, blobstore: Arc<dyn Blobstore>, options: Options) -> Self {
        Self {
            lookup,
            blobstore,
            options,
        }
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub async fn setup(&self) -> FsResult<()> {
        tokio::fs::create_dir_all(self.lookup.spaces_dir())
            .await
            .map_err(|e| FsError::Io(format!("create spaces dir: {}", e)))?;
        Ok(())
    }

    // ---- creation ----

    /// Create a new space: a root directory node that is its own parent,
    /// carrying owner, quota and the aggregate counters.
    pub async fn create_space(
        &self,
        owner: &User,
        space_id: Option<String>,
        quota: Option<u64>,
    ) -> FsResult<Node> {
        let space_id = space_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = self.lookup.internal_path(&space_id, &space_id);
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            return Err(FsError::AlreadyExists(format!("space {}", space_id)));
        }
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| FsError::Io(format!("create space root: {}", e)))?;
        tokio::fs::create_dir_all(self.lookup.trash_dir(&space_id))
            .await
            .map_err(|e| FsError::Io(format!("create trash dir: {}", e)))?;

        let mut attrs = Attributes::new();
        attrs.set_string(ID_ATTR, &space_id);
        attrs.set_string(PARENTID_ATTR, &space_id);
        attrs.set_string(NAME_ATTR, "");
        attrs.set_string(TYPE_ATTR, NodeType::Dir.as_str());
        attrs.set_string(MTIME_ATTR, format_mtime(&Utc::now()));
        attrs.set_u64(TREESIZE_ATTR, 0);
        attrs.set_string(OWNER_ID_ATTR, &owner.id);
        attrs.set_string(OWNER_IDP_ATTR, &owner.idp);
        let quota = quota.or(self.options.default_quota_bytes);
        if let Some(quota) = quota {
            attrs.set_u64(QUOTA_ATTR, quota);
        }
        self.lookup.backend().set_many(&path, attrs, true).await?;

        self.lookup.node_from_id(&space_id, &space_id).await
    }

    /// Create a directory for a non-existing handle with parent and name
    /// set. Allocates an id unless the caller already did.
    pub async fn create_dir(&self, node: &mut Node) -> FsResult<()> {
        self.create_node(node, NodeType::Dir, None).await
    }

    /// Create an empty file placeholder.
    pub async fn touch_file(&self, node: &mut Node) -> FsResult<()> {
        self.create_node(node, NodeType::File, None).await
    }

    /// Create a reference node pointing at an external URI.
    pub async fn create_reference(&self, node: &mut Node, target_uri: &str) -> FsResult<()> {
        self.create_node(node, NodeType::Reference, Some(target_uri))
            .await
    }

    async fn create_node(
        &self,
        node: &mut Node,
        node_type: NodeType,
        reference_target: Option<&str>,
    ) -> FsResult<()> {
        validate_name(&node.name)?;
        if node.exists {
            return Err(FsError::AlreadyExists(node.name.clone()));
        }
        if node.id.is_empty() {
            node.id = Uuid::new_v4().to_string();
        }
        node.node_type = node_type;

        let path = node.internal_path();
        match node_type {
            NodeType::Dir => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| FsError::Io(format!("create dir entry: {}", e)))?;
            }
            NodeType::File | NodeType::Reference => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| FsError::Io(format!("create shard dirs: {}", e)))?;
                }
                tokio::fs::OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(&path)
                    .await
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::AlreadyExists {
                            FsError::AlreadyExists(node.id.clone())
                        } else {
                            FsError::Io(format!("create file entry: {}", e))
                        }
                    })?;
            }
        }

        let mtime = Utc::now();
        let mut attrs = Attributes::new();
        attrs.set_string(ID_ATTR, &node.id);
        attrs.set_string(PARENTID_ATTR, &node.parent_id);
        attrs.set_string(NAME_ATTR, &node.name);
        attrs.set_string(TYPE_ATTR, node_type.as_str());
        attrs.set_string(MTIME_ATTR, format_mtime(&mtime));
        if node_type == NodeType::Dir {
            attrs.set_u64(TREESIZE_ATTR, 0);
        }
        if let Some(uri) = reference_target {
            attrs.set_string(REFERENCE_ATTR, uri);
        }
        self.lookup.backend().set_many(&path, attrs, true).await?;

        if let Err(e) = self
            .link_child(&node.space_id, &node.parent_id, &node.name, &node.id)
            .await
        {
            // Unlink the orphaned entry before surfacing the error.
            let _ = match node_type {
                NodeType::Dir => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            return Err(e);
        }
        node.exists = true;

        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        self.propagate(&parent, 0, &mtime).await
    }

    /// Link a child into its parent's entry directory by name. The
    /// upload pre-commit path links new file nodes itself, under the
    /// target metadata lock.
    pub async fn link_child(
        &self,
        space_id: &str,
        parent_id: &str,
        name: &str,
        child_id: &str,
    ) -> FsResult<()> {
        let link = self.lookup.internal_path(space_id, parent_id).join(name);
        let target = self.lookup.child_link_target(parent_id, child_id);
        tokio::fs::symlink(&target, &link).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(name.to_string()),
            std::io::ErrorKind::NotFound => FsError::NotFound(format!("parent {}", parent_id)),
            _ => FsError::Io(format!("link {}: {}", link.display(), e)),
        })
    }

    // ---- listing ----

    /// Resolve every child of a directory. Reserved entries and nodes
    /// still awaiting post-processing are not listed.
    pub async fn list_folder(&self, node: &Node) -> FsResult<Vec<Node>> {
        if !node.is_dir() {
            return Err(FsError::InvalidArg(format!("{} is not a directory", node.id)));
        }
        let mut entries = tokio::fs::read_dir(node.internal_path())
            .await
            .map_err(|e| FsError::Io(format!("read dir {}: {}", node.id, e)))?;

        let mut children = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::Io(format!("read dir {}: {}", node.id, e)))?
        {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if name.ends_with(meta_store::LOCKFILE_SUFFIX) {
                continue;
            }
            let child = node.child(name).await?;
            if !child.exists {
                warn!("dangling child link {} under {}", name, node.id);
                continue;
            }
            if child.is_processing().await {
                continue;
            }
            children.push(child);
        }
        Ok(children)
    }

    // ---- move ----

    /// Atomic rename of the parent link. Updates the child's identity
    /// attributes and propagates the size delta along both chains.
    pub async fn move_node(&self, _ctx: &RequestContext, old: &Node, new: &Node) -> FsResult<()> {
        validate_name(&new.name)?;
        if !old.exists {
            return Err(FsError::NotFound(old.name.clone()));
        }
        if new.exists {
            return Err(FsError::AlreadyExists(new.name.clone()));
        }

        let old_parent = self
            .lookup
            .node_from_id(&old.space_id, &old.parent_id)
            .await?;
        let new_parent = self
            .lookup
            .node_from_id(&new.space_id, &new.parent_id)
            .await?;
        if !new_parent.exists || !new_parent.is_dir() {
            return Err(FsError::NotFound(format!("parent {}", new.parent_id)));
        }

        let old_path = self.lookup.path(old).await?;
        let size_diff = self.subtree_size(old).await? as i64;
        let same_parent = old_parent.id == new_parent.id;

        {
            // Lock both parents, ascending id order, to serialize against
            // concurrent moves touching the same directories.
            let backend = self.lookup.backend();
            let (first, second) = if old_parent.id <= new_parent.id {
                (&old_parent, &new_parent)
            } else {
                (&new_parent, &old_parent)
            };
            let _first_guard = backend.lock(&first.internal_path()).await?;
            let _second_guard = if same_parent {
                None
            } else {
                Some(backend.lock(&second.internal_path()).await?)
            };

            let old_link = old_parent.internal_path().join(&old.name);
            if same_parent {
                let new_link = new_parent.internal_path().join(&new.name);
                tokio::fs::rename(&old_link, &new_link)
                    .await
                    .map_err(|e| FsError::Io(format!("move {}: {}", old.id, e)))?;
            } else {
                // The link target is relative to the parent entry, so a
                // new parent needs a freshly computed link.
                self.link_child(&new.space_id, &new_parent.id, &new.name, &old.id)
                    .await?;
                tokio::fs::remove_file(&old_link)
                    .await
                    .map_err(|e| FsError::Io(format!("unlink {}: {}", old_link.display(), e)))?;
            }

            let mut attrs = Attributes::new();
            attrs.set_string(PARENTID_ATTR, &new_parent.id);
            attrs.set_string(NAME_ATTR, &new.name);
            self.lookup
                .backend()
                .set_many(&old.internal_path(), attrs, true)
                .await?;
        }

        self.lookup
            .invalidate_cached_subtree(&old.space_id, &old.id, &old_path);

        let now = Utc::now();
        if same_parent {
            self.propagate(&old_parent, 0, &now).await?;
        } else {
            self.propagate(&old_parent, -size_diff, &now).await?;
            self.propagate(&new_parent, size_diff, &now).await?;
        }
        Ok(())
    }

    /// Bytes accounted to a node: blob size for files, aggregated tree
    /// size for directories.
    pub async fn subtree_size(&self, node: &Node) -> FsResult<u64> {
        if node.is_dir() {
            let attrs = node.read_metadata(&[TREESIZE_ATTR]).await?;
            Ok(attrs.get_u64(TREESIZE_ATTR).unwrap_or(0))
        } else {
            Ok(node.blob_size)
        }
    }

    // ---- propagation ----

    /// Fold `size_diff` into the tree size of `node` and every ancestor
    /// up to the space root, raising tree mtimes to `source_mtime` on
    /// the way. Callers pass the first directory to account, usually
    /// the mutated node's parent. Each update happens under the
    /// ancestor's own metadata lock. Stops early at an ancestor marked
    /// `propagation=stop`; the trash area is never touched because
    /// trashed entries are outside every parent chain.
    pub async fn propagate(
        &self,
        node: &Node,
        size_diff: i64,
        source_mtime: &DateTime<Utc>,
    ) -> FsResult<()> {
        if !self.options.tree_time_accounting && !self.options.tree_size_accounting {
            return Ok(());
        }

        let mut current = node.clone();
        loop {
            let path = current.internal_path();
            {
                let _guard = self.lookup.backend().lock(&path).await?;
                let attrs = current
                    .read_metadata(&[PROPAGATION_ATTR, TREE_MTIME_ATTR, TREESIZE_ATTR])
                    .await?;
                if attrs.get_string(PROPAGATION_ATTR).as_deref() == Some(PROPAGATION_STOP) {
                    debug!("propagation stops at {}", current.id);
                    return Ok(());
                }

                let mut update = Attributes::new();
                if self.options.tree_time_accounting {
                    let newer = match attrs.get_string(TREE_MTIME_ATTR) {
                        Some(raw) => parse_mtime(&raw)
                            .map(|current_tmtime| *source_mtime > current_tmtime)
                            .unwrap_or(true),
                        None => true,
                    };
                    if newer {
                        update.set_string(TREE_MTIME_ATTR, format_mtime(source_mtime));
                    }
                }
                if self.options.tree_size_accounting && size_diff != 0 {
                    let current_size = attrs.get_u64(TREESIZE_ATTR).unwrap_or(0);
                    let new_size = if size_diff > 0 {
                        current_size.saturating_add(size_diff as u64)
                    } else {
                        current_size.saturating_sub(size_diff.unsigned_abs())
                    };
                    update.set_u64(TREESIZE_ATTR, new_size);
                }

                if !update.is_empty() {
                    self.lookup.backend().set_many(&path, update, false).await?;
                }
            }

            if current.is_space_root() {
                return Ok(());
            }
            let parent = self
                .lookup
                .node_from_id(&current.space_id, &current.parent_id)
                .await?;
            if !parent.exists {
                error!(
                    "propagation: dangling parent {} of {}",
                    current.parent_id, current.id
                );
                return Err(FsError::Inconsistent(format!(
                    "dangling parent {}",
                    current.parent_id
                )));
            }
            current = parent;
        }
    }

    // ---- blobs ----

    pub async fn write_blob(&self, node: &Node, source: &std::path::Path) -> FsResult<()> {
        let blob_id = node
            .blob_id
            .as_deref()
            .ok_or_else(|| FsError::InvalidArg(format!("node {} has no blob", node.id)))?;
        self.blobstore
            .upload(&node.space_id, blob_id, node.blob_size, source)
            .await
    }

    pub async fn read_blob(&self, node: &Node) -> FsResult<BlobReader> {
        let blob_id = node
            .blob_id
            .as_deref()
            .ok_or_else(|| FsError::InvalidArg(format!("node {} has no blob", node.id)))?;
        self.blobstore.download(&node.space_id, blob_id).await
    }
}
