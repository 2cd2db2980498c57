use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dfs_lib::{
    format_mtime, parse_mtime, Attributes, FsError, FsResult, RequestContext, BLOBID_ATTR,
    BLOBSIZE_ATTR, CHECKSUM_PREFIX, MTIME_ATTR, TYPE_ATTR,
};
use fs_node::{Node, REVISION_DELIMITER};
use log::debug;

use crate::tree::Tree;

/// Attributes that travel between a live node and its revisions.
pub fn is_revision_attr(key: &str) -> bool {
    key == TYPE_ATTR
        || key == BLOBID_ATTR
        || key == BLOBSIZE_ATTR
        || key == MTIME_ATTR
        || key.starts_with(CHECKSUM_PREFIX)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RevisionInfo {
    /// `<node-id>.REV.<mtime>`, the client-facing restore key.
    pub key: String,
    pub mtime: DateTime<Utc>,
    pub size: u64,
}

impl Tree {
    pub async fn list_revisions(&self, node: &Node) -> FsResult<Vec<RevisionInfo>> {
        let mut revisions = Vec::new();
        for (path, ts) in self.scan_revisions(&node.space_id, &node.id).await? {
            let attrs = self.lookup.backend().get_all(&path).await?;
            revisions.push(RevisionInfo {
                key: format!("{}{}{}", node.id, REVISION_DELIMITER, ts),
                mtime: parse_mtime(&ts)?,
                size: attrs.get_u64(BLOBSIZE_ATTR).unwrap_or(0),
            });
        }
        revisions.sort_by_key(|r| r.mtime);
        Ok(revisions)
    }

    /// Make the given revision the live state. The current live state is
    /// preserved as a new revision keyed by its mtime, so the operation
    /// can be undone.
    pub async fn restore_revision(
        &self,
        _ctx: &RequestContext,
        node: &Node,
        key: &str,
    ) -> FsResult<()> {
        let ts = self.revision_ts_from_key(node, key)?;
        let rev_path = self.lookup.version_path(&node.space_id, &node.id, &ts);
        let rev_attrs = self.lookup.backend().get_all(&rev_path).await?;
        if rev_attrs.is_empty() {
            return Err(FsError::NotFound(format!("revision {}", key)));
        }

        let internal = node.internal_path();
        let size_diff;
        {
            let _guard = self.lookup.backend().lock(&internal).await?;

            let live_attrs = self.lookup.backend().get_all(&internal).await?;
            let live_mtime = parse_mtime(&live_attrs.require_string(MTIME_ATTR)?)?;
            let live_size = live_attrs.get_u64(BLOBSIZE_ATTR).unwrap_or(0);
            let rev_size = rev_attrs.get_u64(BLOBSIZE_ATTR).unwrap_or(0);
            size_diff = rev_size as i64 - live_size as i64;

            // Preserve the current live state as a revision of its own.
            let keep_path =
                self.lookup
                    .version_path(&node.space_id, &node.id, &format_mtime(&live_mtime));
            touch_entry(&keep_path).await?;
            self.lookup
                .backend()
                .copy_selected(&internal, &keep_path, &is_revision_attr, true)
                .await?;

            let mut restored = Attributes::new();
            for (attr_key, value) in rev_attrs.iter() {
                if is_revision_attr(attr_key) {
                    restored.set(attr_key.clone(), value.clone());
                }
            }
            self.lookup
                .backend()
                .set_many(&internal, restored, false)
                .await?;

            tokio::fs::remove_file(&rev_path)
                .await
                .map_err(|e| FsError::Io(format!("consume revision {}: {}", key, e)))?;
        }
        debug!("restored revision {} onto {}", key, node.id);

        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        self.propagate(&parent, size_diff, &Utc::now()).await
    }

    /// Drop a revision and its blob.
    pub async fn delete_revision(
        &self,
        _ctx: &RequestContext,
        node: &Node,
        key: &str,
    ) -> FsResult<()> {
        let ts = self.revision_ts_from_key(node, key)?;
        let rev_path = self.lookup.version_path(&node.space_id, &node.id, &ts);
        let attrs = self.lookup.backend().get_all(&rev_path).await?;
        if attrs.is_empty() {
            return Err(FsError::NotFound(format!("revision {}", key)));
        }

        if let Some(blob_id) = attrs.get_string(BLOBID_ATTR) {
            match self.blobstore.delete(&node.space_id, &blob_id).await {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tokio::fs::remove_file(&rev_path)
            .await
            .map_err(|e| FsError::Io(format!("delete revision {}: {}", key, e)))
    }

    /// Remove every revision of a node, blobs included. Used by purge.
    pub(crate) async fn purge_revisions(&self, space_id: &str, node_id: &str) -> FsResult<()> {
        for (path, _ts) in self.scan_revisions(space_id, node_id).await? {
            let attrs = self.lookup.backend().get_all(&path).await?;
            if let Some(blob_id) = attrs.get_string(BLOBID_ATTR) {
                match self.blobstore.delete(space_id, &blob_id).await {
                    Ok(()) | Err(FsError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(FsError::Io(format!("purge revision: {}", e)));
                }
            }
        }
        Ok(())
    }

    /// Revisions are siblings of the node entry in its shard directory,
    /// named `<entry>.REV.<mtime>`.
    async fn scan_revisions(
        &self,
        space_id: &str,
        node_id: &str,
    ) -> FsResult<Vec<(PathBuf, String)>> {
        let internal = self.lookup.internal_path(space_id, node_id);
        let shard_dir = match internal.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return Ok(Vec::new()),
        };
        let entry_name = match internal.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(Vec::new()),
        };
        let prefix = format!("{}{}", entry_name, REVISION_DELIMITER);

        let mut entries = match tokio::fs::read_dir(&shard_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::Io(format!("scan revisions: {}", e))),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::Io(format!("scan revisions: {}", e)))?
        {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(ts) = name.strip_prefix(&prefix) {
                if name.ends_with(meta_store::LOCKFILE_SUFFIX) {
                    continue;
                }
                found.push((entry.path(), ts.to_string()));
            }
        }
        Ok(found)
    }

    fn revision_ts_from_key(&self, node: &Node, key: &str) -> FsResult<String> {
        let prefix = format!("{}{}", node.id, REVISION_DELIMITER);
        key.strip_prefix(&prefix)
            .map(|ts| ts.to_string())
            .ok_or_else(|| FsError::InvalidArg(format!("malformed revision key {}", key)))
    }
}

pub(crate) async fn touch_entry(path: &std::path::Path) -> FsResult<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await
        .map_err(|e| FsError::Io(format!("create {}: {}", path.display(), e)))?;
    Ok(())
}
