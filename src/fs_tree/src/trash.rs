use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dfs_lib::{
    format_mtime, parse_mtime, shard_id, Attributes, FsError, FsResult, NodeType, Reference,
    RequestContext, ResourceId, BLOBID_ATTR, BLOBSIZE_ATTR, ID_ATTR, NAME_ATTR, PARENTID_ATTR,
    TRASH_DELETION_TIME_ATTR, TRASH_ORIGIN_ATTR, TREESIZE_ATTR, TYPE_ATTR,
};
use fs_node::{Node, TRASH_DELIMITER};
use log::warn;

use crate::tree::Tree;

/// One entry of a space's recycle bin.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecycleItem {
    pub key: String,
    pub origin: String,
    pub deletion_time: DateTime<Utc>,
    pub node_type: NodeType,
    pub size: u64,
}

/// A prepared restore. The caller checks its preconditions against the
/// target, then commits via [`Tree::commit_restore`].
#[derive(Debug)]
pub struct RestoreItem {
    pub key: String,
    pub space_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub size: u64,
    pub origin: String,
    pub target_parent: Node,
    pub target_name: String,
    pub(crate) trashed_path: PathBuf,
    pub(crate) trash_link: PathBuf,
}

/// A prepared purge, committed via [`Tree::commit_purge`].
pub struct PurgeItem {
    pub key: String,
    pub space_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub blob_id: Option<String>,
    pub(crate) trashed_path: PathBuf,
    pub(crate) trash_link: PathBuf,
}

struct TrashEntry {
    node_id: String,
    node_type: NodeType,
    name: String,
    origin: String,
    deletion_time: DateTime<Utc>,
    size: u64,
    blob_id: Option<String>,
    trashed_path: PathBuf,
    trash_link: PathBuf,
}

impl Tree {
    // ---- delete ----

    /// Move a node into the space trash, keyed by its id. The blob stays
    /// in place; purge removes it later.
    pub async fn delete(&self, _ctx: &RequestContext, node: &Node) -> FsResult<()> {
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        if node.is_space_root() {
            return Err(FsError::InvalidArg("cannot delete a space root".to_string()));
        }

        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        let origin = self.lookup.path(node).await?;
        let size = self.subtree_size(node).await? as i64;
        let deleted_at = Utc::now();
        let ts = format_mtime(&deleted_at);

        let mut attrs = Attributes::new();
        attrs.set_string(TRASH_ORIGIN_ATTR, &origin);
        attrs.set_string(TRASH_DELETION_TIME_ATTR, &ts);
        self.lookup
            .backend()
            .set_many(&node.internal_path(), attrs, true)
            .await?;

        let link = parent.internal_path().join(&node.name);
        tokio::fs::remove_file(&link)
            .await
            .map_err(|e| FsError::Io(format!("unlink {}: {}", link.display(), e)))?;

        let internal = node.internal_path();
        let mut trashed_os = internal.clone().into_os_string();
        trashed_os.push(TRASH_DELIMITER);
        trashed_os.push(&ts);
        let trashed_path = PathBuf::from(trashed_os);
        tokio::fs::rename(&internal, &trashed_path)
            .await
            .map_err(|e| FsError::Io(format!("trash {}: {}", node.id, e)))?;

        let trash_link = self.lookup.trash_dir(&node.space_id).join(&node.id);
        let target = format!(
            "../nodes/{}{}{}",
            shard_id(&node.id),
            TRASH_DELIMITER,
            ts
        );
        tokio::fs::symlink(&target, &trash_link)
            .await
            .map_err(|e| FsError::Io(format!("link trash entry {}: {}", node.id, e)))?;

        self.lookup
            .invalidate_cached_subtree(&node.space_id, &node.id, &origin);
        self.propagate(&parent, -size, &deleted_at).await
    }

    // ---- listing ----

    pub async fn list_recycle(
        &self,
        _ctx: &RequestContext,
        space_id: &str,
    ) -> FsResult<Vec<RecycleItem>> {
        let trash_dir = self.lookup.trash_dir(space_id);
        let mut entries = match tokio::fs::read_dir(&trash_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::Io(format!("read trash dir: {}", e))),
        };

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::Io(format!("read trash dir: {}", e)))?
        {
            let key = match entry.file_name().to_str() {
                Some(key) => key.to_string(),
                None => continue,
            };
            match self.read_trash_entry(space_id, &key).await {
                Ok(found) => items.push(RecycleItem {
                    key,
                    origin: found.origin,
                    deletion_time: found.deletion_time,
                    node_type: found.node_type,
                    size: found.size,
                }),
                Err(e) => warn!("skipping trash entry {}: {}", key, e),
            }
        }
        Ok(items)
    }

    async fn read_trash_entry(&self, space_id: &str, key: &str) -> FsResult<TrashEntry> {
        let trash_link = self.lookup.trash_dir(space_id).join(key);
        let target = tokio::fs::read_link(&trash_link).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::NotFound(format!("trash item {}", key))
            } else {
                FsError::Io(format!("readlink {}: {}", trash_link.display(), e))
            }
        })?;
        let trashed_path = self.lookup.trash_dir(space_id).join(target);

        let attrs = self.lookup.backend().get_all(&trashed_path).await?;
        let node_type = NodeType::from_attr(&attrs.require_string(TYPE_ATTR)?)?;
        let size = match node_type {
            NodeType::Dir => attrs.get_u64(TREESIZE_ATTR).unwrap_or(0),
            _ => attrs.get_u64(BLOBSIZE_ATTR).unwrap_or(0),
        };
        Ok(TrashEntry {
            node_id: attrs.require_string(ID_ATTR)?,
            node_type,
            name: attrs.require_string(NAME_ATTR)?,
            origin: attrs.require_string(TRASH_ORIGIN_ATTR)?,
            deletion_time: parse_mtime(&attrs.require_string(TRASH_DELETION_TIME_ATTR)?)?,
            size,
            blob_id: attrs.get_string(BLOBID_ATTR),
            trashed_path,
            trash_link,
        })
    }

    // ---- restore ----

    /// Prepare a restore. With no explicit target the item goes back to
    /// its recorded origin; the original parent must still exist.
    pub async fn restore_recycle_item(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        key: &str,
        restore_target: Option<&Node>,
    ) -> FsResult<RestoreItem> {
        let entry = self.read_trash_entry(space_id, key).await?;

        let (target_parent, target_name) = match restore_target {
            Some(target) => {
                let parent = self
                    .lookup
                    .node_from_id(space_id, &target.parent_id)
                    .await?;
                if !parent.exists || !parent.is_dir() {
                    return Err(FsError::Aborted(format!(
                        "restore target parent {} does not exist",
                        target.parent_id
                    )));
                }
                (parent, target.name.clone())
            }
            None => {
                let (parent_path, _) = split_origin(&entry.origin);
                let root = Reference::relative(ResourceId::space_root(space_id), parent_path);
                let parent = self.lookup.node_from_resource(ctx, &root).await?;
                if !parent.exists || !parent.is_dir() {
                    return Err(FsError::Aborted(format!(
                        "original parent of {} no longer exists",
                        key
                    )));
                }
                (parent, entry.name.clone())
            }
        };

        Ok(RestoreItem {
            key: key.to_string(),
            space_id: space_id.to_string(),
            node_id: entry.node_id,
            node_type: entry.node_type,
            size: entry.size,
            origin: entry.origin,
            target_parent,
            target_name,
            trashed_path: entry.trashed_path,
            trash_link: entry.trash_link,
        })
    }

    /// Execute a prepared restore: rename the entry back, relink it and
    /// propagate the size gain.
    pub async fn commit_restore(&self, item: RestoreItem) -> FsResult<Node> {
        let existing = item.target_parent.child(&item.target_name).await?;
        if existing.exists {
            return Err(FsError::AlreadyExists(item.target_name.clone()));
        }

        let internal = self.lookup.internal_path(&item.space_id, &item.node_id);
        tokio::fs::rename(&item.trashed_path, &internal)
            .await
            .map_err(|e| FsError::Io(format!("restore {}: {}", item.key, e)))?;

        let mut attrs = Attributes::new();
        attrs.set_string(PARENTID_ATTR, &item.target_parent.id);
        attrs.set_string(NAME_ATTR, &item.target_name);
        self.lookup.backend().set_many(&internal, attrs, true).await?;
        self.lookup
            .backend()
            .remove(&internal, TRASH_ORIGIN_ATTR)
            .await?;
        self.lookup
            .backend()
            .remove(&internal, TRASH_DELETION_TIME_ATTR)
            .await?;

        self.link_child_for_restore(&item).await?;
        if let Err(e) = tokio::fs::remove_file(&item.trash_link).await {
            warn!("remove trash link {}: {}", item.trash_link.display(), e);
        }

        let restored = self
            .lookup
            .node_from_id(&item.space_id, &item.node_id)
            .await?;
        self.propagate(&item.target_parent, item.size as i64, &Utc::now())
            .await?;
        Ok(restored)
    }

    async fn link_child_for_restore(&self, item: &RestoreItem) -> FsResult<()> {
        let link = item.target_parent.internal_path().join(&item.target_name);
        let target = self
            .lookup
            .child_link_target(&item.target_parent.id, &item.node_id);
        tokio::fs::symlink(&target, &link)
            .await
            .map_err(|e| FsError::Io(format!("relink {}: {}", item.key, e)))
    }

    // ---- purge ----

    pub async fn purge_recycle_item(
        &self,
        _ctx: &RequestContext,
        space_id: &str,
        key: &str,
    ) -> FsResult<PurgeItem> {
        let entry = self.read_trash_entry(space_id, key).await?;
        Ok(PurgeItem {
            key: key.to_string(),
            space_id: space_id.to_string(),
            node_id: entry.node_id,
            node_type: entry.node_type,
            blob_id: entry.blob_id,
            trashed_path: entry.trashed_path,
            trash_link: entry.trash_link,
        })
    }

    /// Execute a prepared purge: unlink blobs, revisions and entries of
    /// the whole trashed subtree, then drop the trash link.
    pub async fn commit_purge(&self, item: PurgeItem) -> FsResult<()> {
        let mut files: Vec<(PathBuf, String, Option<String>)> = Vec::new();
        let mut dirs: Vec<PathBuf> = Vec::new();
        let mut queue: Vec<(PathBuf, String, NodeType, Option<String>)> = vec![(
            item.trashed_path.clone(),
            item.node_id.clone(),
            item.node_type,
            item.blob_id.clone(),
        )];

        while let Some((path, node_id, node_type, blob_id)) = queue.pop() {
            match node_type {
                NodeType::Dir => {
                    let mut entries = tokio::fs::read_dir(&path)
                        .await
                        .map_err(|e| FsError::Io(format!("purge read {}: {}", path.display(), e)))?;
                    while let Some(entry) = entries
                        .next_entry()
                        .await
                        .map_err(|e| FsError::Io(format!("purge read: {}", e)))?
                    {
                        let target = match tokio::fs::read_link(entry.path()).await {
                            Ok(target) => target,
                            Err(_) => continue,
                        };
                        let child_id = fs_node::Lookup::node_id_from_link(&target)?;
                        let child_path = self.lookup.internal_path(&item.space_id, &child_id);
                        let attrs = self.lookup.backend().get_all(&child_path).await?;
                        let child_type = NodeType::from_attr(&attrs.require_string(TYPE_ATTR)?)?;
                        queue.push((
                            child_path,
                            child_id,
                            child_type,
                            attrs.get_string(BLOBID_ATTR),
                        ));
                    }
                    dirs.push(path);
                }
                NodeType::File | NodeType::Reference => files.push((path, node_id, blob_id)),
            }
        }

        for (path, node_id, blob_id) in files {
            if let Some(blob_id) = blob_id {
                match self.blobstore.delete(&item.space_id, &blob_id).await {
                    Ok(()) | Err(FsError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            self.purge_revisions(&item.space_id, &node_id).await?;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(FsError::Io(format!("purge {}: {}", path.display(), e)));
                }
            }
            self.remove_stale_lockfile(&path).await;
        }
        for path in dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(FsError::Io(format!("purge {}: {}", path.display(), e)));
                }
            }
            self.remove_stale_lockfile(&path).await;
        }
        // The top entry was locked under its pre-trash path.
        self.remove_stale_lockfile(&self.lookup.internal_path(&item.space_id, &item.node_id))
            .await;

        tokio::fs::remove_file(&item.trash_link)
            .await
            .map_err(|e| FsError::Io(format!("remove trash link {}: {}", item.key, e)))
    }

    /// Lockfiles outlive lock releases; once the entry they guarded is
    /// purged they are garbage.
    async fn remove_stale_lockfile(&self, entry_path: &std::path::Path) {
        let lockfile = self.lookup.backend().lockfile_path(entry_path);
        let _ = tokio::fs::remove_file(&lockfile).await;
    }
}

/// Split a space-relative origin path into (parent path, name).
fn split_origin(origin: &str) -> (&str, &str) {
    match origin.rfind('/') {
        Some(idx) => (&origin[..idx], &origin[idx + 1..]),
        None => ("", origin),
    }
}
