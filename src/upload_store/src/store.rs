use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dfs_lib::{
    calculate_etag, format_mtime, Attributes, FsError, FsResult, NodeType, Options,
    RequestContext, BLOBID_ATTR, BLOBSIZE_ATTR, CHECKSUM_PREFIX, ID_ATTR, MTIME_ATTR,
    NAME_ATTR, PARENTID_ATTR, PROCESSING_STATUS_PREFIX, STATUS_ATTR, TYPE_ATTR,
};
use fs_node::{validate_name, Lookup, Node};
use fs_tree::{is_revision_attr, Tree};
use log::{info, warn};
use meta_store::UnlockHandle;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::session::{SessionRecord, UploadHeaders, UploadSession};

/// Manages the upload lifecycle: persistent session state, chunk
/// assembly and the pre-commit step that turns a session into a node.
pub struct SessionStore {
    lookup: Lookup,
    tree: Arc<Tree>,
    uploads_dir: PathBuf,
    disable_versioning: bool,
}

impl SessionStore {
    pub fn new(lookup: Lookup, tree: Arc<Tree>, options: &Options) -> Self {
        Self {
            lookup,
            tree,
            uploads_dir: options.uploads_dir(),
            disable_versioning: options.disable_versioning,
        }
    }

    pub async fn setup(&self) -> FsResult<()> {
        tokio::fs::create_dir_all(&self.uploads_dir)
            .await
            .map_err(|e| FsError::Io(format!("create uploads dir: {}", e)))
    }

    // ---- session lifecycle ----

    /// Initiate a session for the given target handle. The target node
    /// id is allocated here: the existing id for overwrites, a fresh one
    /// for new files.
    pub async fn new_session(
        &self,
        ctx: &RequestContext,
        target: &Node,
        declared_size: u64,
        mtime: Option<chrono::DateTime<Utc>>,
        headers: UploadHeaders,
    ) -> FsResult<UploadSession> {
        validate_name(&target.name)?;
        let node_id = if target.exists {
            target.id.clone()
        } else {
            Uuid::new_v4().to_string()
        };

        let record = SessionRecord {
            session_id: Uuid::new_v4().to_string(),
            space_id: target.space_id.clone(),
            node_id,
            parent_id: target.parent_id.clone(),
            filename: target.name.clone(),
            declared_size,
            node_exists: target.exists,
            mtime,
            headers,
            blob_id: None,
            executing_user: ctx.user.clone(),
            lock_id: ctx.lock_id.clone(),
            metadata: Default::default(),
        };
        let session = UploadSession::new(self.uploads_dir.clone(), record);
        session.create_bin().await?;
        session.persist().await?;
        info!(
            "upload {} initiated for {}/{}",
            session.id(),
            session.record.parent_id,
            session.record.filename
        );
        Ok(session)
    }

    /// Load a persisted session. The current offset comes from the chunk
    /// bin length, so an interrupted transfer resumes where it stopped.
    pub async fn get(&self, id: &str) -> FsResult<UploadSession> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(FsError::InvalidArg(format!("malformed session id {:?}", id)));
        }
        let info_path = self.uploads_dir.join(format!("{}.info", id));
        let raw = match tokio::fs::read(&info_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("upload {}", id)))
            }
            Err(e) => return Err(FsError::Io(format!("read session {}: {}", id, e))),
        };
        let record: SessionRecord = serde_json::from_slice(&raw)
            .map_err(|e| FsError::Inconsistent(format!("decode session {}: {}", id, e)))?;

        let mut session = UploadSession::new(self.uploads_dir.clone(), record);
        let bin_meta = match tokio::fs::metadata(session.bin_path()).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(format!("upload {}", id)))
            }
            Err(e) => return Err(FsError::Io(format!("stat chunk bin {}: {}", id, e))),
        };
        session.offset = bin_meta.len();
        Ok(session)
    }

    /// Enumerate every persisted session, e.g. for crash recovery.
    pub async fn list(&self) -> FsResult<Vec<UploadSession>> {
        let mut entries = match tokio::fs::read_dir(&self.uploads_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::Io(format!("read uploads dir: {}", e))),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::Io(format!("read uploads dir: {}", e)))?
        {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".info")) else {
                continue;
            };
            match self.get(id).await {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("skipping unreadable session {}: {}", id, e),
            }
        }
        Ok(sessions)
    }

    // ---- pre-commit ----

    /// Create (or prepare the overwrite of) the target node for a
    /// sealed session. Everything from the lock acquisition to the
    /// attribute overwrite happens under the target's metadata write
    /// lock. On failure after this returns, the caller must invoke
    /// [`SessionStore::cleanup`] with revert semantics.
    pub async fn create_node_for_upload(
        &self,
        session: &mut UploadSession,
        init_attrs: Attributes,
    ) -> FsResult<Node> {
        let ctx = session_context(session);
        let record = session.record.clone();

        let mut node = Node::new(
            self.lookup.clone(),
            record.space_id.clone(),
            record.node_id.clone(),
            record.parent_id.clone(),
            record.filename.clone(),
            NodeType::File,
            record.declared_size,
        );
        let space_root = self
            .lookup
            .node_from_id(&record.space_id, &record.space_id)
            .await?;
        if !space_root.exists {
            return Err(FsError::NotFound(format!("space {}", record.space_id)));
        }

        node.check_lock(&ctx).await?;

        let blob_id = Uuid::new_v4().to_string();
        node.blob_id = Some(blob_id.clone());
        session.record.blob_id = Some(blob_id.clone());

        let _guard = if record.node_exists {
            self.update_existing_node(session, &node, &space_root).await?
        } else {
            self.init_new_node(session, &node, &space_root).await?
        };

        let mtime = session.record.mtime.unwrap_or_else(Utc::now);
        let mut attrs = init_attrs;
        attrs.set_string(ID_ATTR, &node.id);
        attrs.set_string(MTIME_ATTR, format_mtime(&mtime));
        attrs.set_string(TYPE_ATTR, NodeType::File.as_str());
        attrs.set_string(PARENTID_ATTR, &node.parent_id);
        attrs.set_string(NAME_ATTR, &node.name);
        attrs.set_string(BLOBID_ATTR, &blob_id);
        attrs.set_u64(BLOBSIZE_ATTR, node.blob_size);
        attrs.set_string(
            STATUS_ATTR,
            format!("{}{}", PROCESSING_STATUS_PREFIX, session.id()),
        );
        self.lookup
            .backend()
            .set_many(&node.internal_path(), attrs, false)
            .await?;

        session.persist().await?;
        node.exists = true;
        Ok(node)
    }

    /// New target: create shard directories, the node entry (exclusive)
    /// and the parent link, then reserve quota for the full size.
    async fn init_new_node(
        &self,
        session: &mut UploadSession,
        node: &Node,
        space_root: &Node,
    ) -> FsResult<UnlockHandle> {
        let path = node.internal_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::Io(format!("create shard dirs: {}", e)))?;
        }

        let guard = self.lookup.backend().lock(&path).await?;

        tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    FsError::AlreadyExists(node.id.clone())
                } else {
                    FsError::Io(format!("create node entry: {}", e))
                }
            })?;

        self.tree
            .link_child(&node.space_id, &node.parent_id, &node.name, &node.id)
            .await?;

        Node::check_quota(space_root, false, 0, session.record.declared_size).await?;
        session.set_size_diff(session.record.declared_size as i64);
        Ok(guard)
    }

    /// Existing target: under the write lock, verify quota and client
    /// preconditions against the previous state, then preserve that
    /// state as a version entry.
    async fn update_existing_node(
        &self,
        session: &mut UploadSession,
        node: &Node,
        space_root: &Node,
    ) -> FsResult<UnlockHandle> {
        let path = node.internal_path();
        let guard = self.lookup.backend().lock(&path).await?;

        let old = self
            .lookup
            .node_from_id(&node.space_id, &node.id)
            .await?;
        if !old.exists {
            return Err(FsError::NotFound(format!("upload target {}", node.id)));
        }
        Node::check_quota(
            space_root,
            true,
            old.blob_size,
            session.record.declared_size,
        )
        .await?;

        let old_mtime = old.get_mtime().await?;
        let old_etag = calculate_etag(&node.id, &old_mtime);

        let headers = &session.record.headers;
        if let Some(if_match) = &headers.if_match {
            if *if_match != old_etag {
                return Err(FsError::Aborted("etag mismatch".to_string()));
            }
        }
        if let Some(if_none_match) = &headers.if_none_match {
            if if_none_match == "*" {
                return Err(FsError::Aborted(
                    "etag mismatch: resource exists".to_string(),
                ));
            }
            if if_none_match
                .split(',')
                .any(|tag| tag.trim() == old_etag)
            {
                return Err(FsError::Aborted("etag mismatch".to_string()));
            }
        }
        if let Some(if_unmodified_since) = &headers.if_unmodified_since {
            if old_mtime > *if_unmodified_since {
                return Err(FsError::Aborted(
                    "if-unmodified-since mismatch".to_string(),
                ));
            }
        }

        if !self.disable_versioning {
            let version_path = self.lookup.version_path(
                &node.space_id,
                &node.id,
                &format_mtime(&old_mtime),
            );
            touch_version(&version_path).await?;
            self.lookup
                .backend()
                .copy_selected(&path, &version_path, &is_revision_attr, true)
                .await?;
            session.set_versions_path(&version_path);
        }

        session.set_size_diff(
            session.record.declared_size as i64 - old.blob_size as i64,
        );
        Ok(guard)
    }

    // ---- post-commit ----

    /// Move the assembled bytes into the blob store. Safe to retry: the
    /// blob write is staged and renamed.
    pub async fn finalize(&self, session: &UploadSession, node: &Node) -> FsResult<()> {
        self.tree.write_blob(node, &session.bin_path()).await
    }

    /// Tear down a session. `revert_node_metadata` undoes the pre-commit
    /// (restores the version for overwrites, removes the entry for new
    /// nodes); `keep_upload` preserves the chunk bin and record for a
    /// retry; `unmark_processing` clears the node's processing status.
    pub async fn cleanup(
        &self,
        session: &UploadSession,
        revert_node_metadata: bool,
        keep_upload: bool,
        unmark_processing: bool,
    ) {
        if revert_node_metadata {
            if let Err(e) = self.revert(session).await {
                warn!("upload {}: revert failed: {}", session.id(), e);
            }
        }

        if unmark_processing {
            match self
                .lookup
                .node_from_id(&session.record.space_id, &session.record.node_id)
                .await
            {
                Ok(node) if node.exists => {
                    if let Err(e) = node.unmark_processing(session.id()).await {
                        warn!("upload {}: unmark processing failed: {}", session.id(), e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("upload {}: could not read node: {}", session.id(), e),
            }
        }

        session.remove_files(!keep_upload, !keep_upload).await;
    }

    async fn revert(&self, session: &UploadSession) -> FsResult<()> {
        let record = &session.record;
        let internal = self
            .lookup
            .internal_path(&record.space_id, &record.node_id);

        if record.node_exists {
            if let Some(version_path) = session.versions_path() {
                self.lookup
                    .backend()
                    .copy_selected(&version_path, &internal, &is_revision_attr, false)
                    .await?;
                tokio::fs::remove_file(&version_path)
                    .await
                    .map_err(|e| FsError::Io(format!("consume version entry: {}", e)))?;
            }
            // The version attributes do not cover the status attribute,
            // and with versioning disabled there is no version at all;
            // the processing status the pre-commit stamped is cleared
            // here so the node does not stay invisible.
            match self
                .lookup
                .node_from_id(&record.space_id, &record.node_id)
                .await
            {
                Ok(node) if node.exists => {
                    if let Err(e) = node.unmark_processing(session.id()).await {
                        warn!("upload {}: revert unmark failed: {}", session.id(), e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("upload {}: revert could not read node: {}", session.id(), e),
            }
        } else {
            let parent_link = self
                .lookup
                .internal_path(&record.space_id, &record.parent_id)
                .join(&record.filename);
            if let Err(e) = tokio::fs::remove_file(&parent_link).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(FsError::Io(format!("unlink upload target: {}", e)));
                }
            }
            if let Err(e) = tokio::fs::remove_file(&internal).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(FsError::Io(format!("remove upload target: {}", e)));
                }
            }
            self.lookup.forget_cached(&record.space_id, &record.node_id);
        }
        Ok(())
    }
}

/// Request context an upload session acts under when its deferred steps
/// run outside the initiating request.
fn session_context(session: &UploadSession) -> RequestContext {
    RequestContext {
        user: session.record.executing_user.clone(),
        lock_id: session.record.lock_id.clone(),
    }
}

/// Content checksum of the assembled chunk bin, streamed in 64k blocks.
pub async fn compute_checksum(bin_path: &Path) -> FsResult<(String, String)> {
    let mut file = tokio::fs::File::open(bin_path)
        .await
        .map_err(|e| FsError::Io(format!("open chunk bin: {}", e)))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| FsError::Io(format!("read chunk bin: {}", e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok((
        format!("{}sha256", CHECKSUM_PREFIX),
        hex::encode(hasher.finalize()),
    ))
}

async fn touch_version(path: &Path) -> FsResult<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await
        .map_err(|e| FsError::Io(format!("create version entry: {}", e)))?;
    Ok(())
}
