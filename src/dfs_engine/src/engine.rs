use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dfs_lib::{
    BytesReceived, Event, EventStream, FsError, FsResult, Grant, Grantee, Options,
    PermissionSet, Reference, RequestContext, ResourceId, StatCache, QUOTA_ATTR, TREESIZE_ATTR,
};
use fs_node::{
    GrantPermissions, LockInfo, Lookup, Node, PermissionsChecker, ResourceInfo,
};
use fs_tree::{RecycleItem, RevisionInfo, Tree};
use log::info;
use meta_store::{BlobReader, Blobstore, MetadataBackend};
use upload_store::{compute_checksum, SessionStore, UploadHeaders};

use crate::postprocessing::Postprocessing;

/// The decomposed storage engine: resolves references, checks
/// permissions and locks, and dispatches to the tree manager and the
/// upload session store. RPC transports live outside and call into
/// this.
pub struct DfsEngine {
    pub(crate) lookup: Lookup,
    pub(crate) tree: Arc<Tree>,
    pub(crate) uploads: SessionStore,
    pub(crate) permissions: Arc<dyn PermissionsChecker>,
    pub(crate) stream: Arc<dyn EventStream>,
    pub(crate) stat_cache: Arc<dyn StatCache>,
    /// Upload ids that reached a terminal post-processing outcome.
    /// Event delivery is at-least-once; this keeps replays idempotent.
    pub(crate) processed: Mutex<std::collections::HashSet<String>>,
    postprocessing: Mutex<Option<Postprocessing>>,
}

impl DfsEngine {
    /// Wire up the engine and start the post-processing workers.
    pub async fn new(
        options: Options,
        backend: Arc<dyn MetadataBackend>,
        blobstore: Arc<dyn Blobstore>,
        stream: Arc<dyn EventStream>,
        stat_cache: Arc<dyn StatCache>,
    ) -> FsResult<Arc<Self>> {
        let lookup = Lookup::new(options.root.clone(), backend);
        let tree = Arc::new(Tree::new(lookup.clone(), blobstore, options.clone()));
        tree.setup().await?;
        let uploads = SessionStore::new(lookup.clone(), tree.clone(), &options);
        uploads.setup().await?;
        let permissions: Arc<dyn PermissionsChecker> =
            Arc::new(GrantPermissions::new(lookup.clone()));

        let engine = Arc::new(Self {
            lookup,
            tree,
            uploads,
            permissions,
            stream,
            stat_cache,
            processed: Mutex::new(Default::default()),
            postprocessing: Mutex::new(None),
        });

        let workers = Postprocessing::start(engine.clone(), options.postprocessing_workers);
        *engine.postprocessing.lock().unwrap() = Some(workers);
        Ok(engine)
    }

    /// Stop the post-processing workers. In-flight sessions stay
    /// recoverable through `list()`.
    pub fn shutdown(&self) {
        self.postprocessing.lock().unwrap().take();
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    async fn resolve(&self, ctx: &RequestContext, reference: &Reference) -> FsResult<Node> {
        self.lookup.node_from_resource(ctx, reference).await
    }

    async fn require(
        &self,
        ctx: &RequestContext,
        node: &Node,
        check: fn(&PermissionSet) -> bool,
    ) -> FsResult<()> {
        if self.permissions.has_permission(ctx, node, check).await? {
            Ok(())
        } else {
            Err(FsError::PermissionDenied(format!(
                "{}/{}",
                node.parent_id, node.name
            )))
        }
    }

    // ---- spaces ----

    pub async fn create_space(
        &self,
        ctx: &RequestContext,
        quota: Option<u64>,
    ) -> FsResult<Node> {
        self.tree.create_space(&ctx.user, None, quota).await
    }

    /// Quota of the space a reference lives in: (total, used, remaining).
    /// Total 0 means unrestricted.
    pub async fn get_quota(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<(u64, u64, u64)> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.get_quota).await?;

        let root = node.space_root().await?;
        let attrs = root.read_metadata(&[QUOTA_ATTR, TREESIZE_ATTR]).await?;
        let used = attrs.get_u64(TREESIZE_ATTR).unwrap_or(0);
        let total = attrs.get_u64(QUOTA_ATTR).unwrap_or(0);
        let remaining = if total == 0 {
            u64::MAX
        } else {
            total.saturating_sub(used)
        };
        Ok((total, used, remaining))
    }

    // ---- stat & listing ----

    pub async fn get_md(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<ResourceInfo> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists || node.is_processing().await {
            return Err(FsError::NotFound(format!(
                "{}/{}",
                node.parent_id, node.name
            )));
        }
        let perms = self.permissions.assemble_permissions(ctx, &node).await?;
        if !perms.stat {
            return Err(FsError::PermissionDenied(node.id.clone()));
        }
        node.as_resource_info(&perms, reference.is_relative()).await
    }

    pub async fn list_folder(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<Vec<ResourceInfo>> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        let perms = self.permissions.assemble_permissions(ctx, &node).await?;
        if !perms.list_container {
            return Err(FsError::PermissionDenied(node.id.clone()));
        }

        let mut infos = Vec::new();
        for child in self.tree.list_folder(&node).await? {
            infos.push(child.as_resource_info(&perms, true).await?);
        }
        Ok(infos)
    }

    pub async fn get_path_by_id(
        &self,
        ctx: &RequestContext,
        id: &ResourceId,
    ) -> FsResult<String> {
        let node = self
            .lookup
            .node_from_id(&id.space_id, &id.opaque_id)
            .await?;
        if !node.exists {
            return Err(FsError::NotFound(id.opaque_id.clone()));
        }
        self.require(ctx, &node, |p| p.get_path).await?;
        self.lookup.path(&node).await
    }

    // ---- structural mutations ----

    pub async fn create_dir(&self, ctx: &RequestContext, reference: &Reference) -> FsResult<()> {
        let mut node = self.resolve(ctx, reference).await?;
        if node.exists {
            return Err(FsError::AlreadyExists(node.name.clone()));
        }
        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        if !parent.exists {
            return Err(FsError::NotFound(format!("parent {}", node.parent_id)));
        }
        self.require(ctx, &parent, |p| p.create_container).await?;
        parent.check_lock(ctx).await?;
        self.tree.create_dir(&mut node).await
    }

    pub async fn touch_file(&self, ctx: &RequestContext, reference: &Reference) -> FsResult<()> {
        let mut node = self.resolve(ctx, reference).await?;
        if node.exists {
            return Err(FsError::AlreadyExists(node.name.clone()));
        }
        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        if !parent.exists {
            return Err(FsError::NotFound(format!("parent {}", node.parent_id)));
        }
        self.require(ctx, &parent, |p| p.initiate_file_upload).await?;
        parent.check_lock(ctx).await?;
        self.tree.touch_file(&mut node).await
    }

    pub async fn create_reference(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        target_uri: &str,
    ) -> FsResult<()> {
        let mut node = self.resolve(ctx, reference).await?;
        if node.exists {
            return Err(FsError::AlreadyExists(node.name.clone()));
        }
        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        if !parent.exists {
            return Err(FsError::NotFound(format!("parent {}", node.parent_id)));
        }
        self.require(ctx, &parent, |p| p.create_container).await?;
        parent.check_lock(ctx).await?;
        self.tree.create_reference(&mut node, target_uri).await
    }

    pub async fn move_node(
        &self,
        ctx: &RequestContext,
        old_ref: &Reference,
        new_ref: &Reference,
    ) -> FsResult<()> {
        let old = self.resolve(ctx, old_ref).await?;
        if !old.exists {
            return Err(FsError::NotFound(old.name.clone()));
        }
        self.require(ctx, &old, |p| p.move_node).await?;

        let new = self.resolve(ctx, new_ref).await?;
        if new.exists {
            return Err(FsError::AlreadyExists(new.name.clone()));
        }
        if old.is_dir() {
            self.require(ctx, &new, |p| p.create_container).await?;
        } else {
            self.require(ctx, &new, |p| p.initiate_file_upload).await?;
        }

        old.check_lock(ctx).await?;
        new.check_lock(ctx).await?;
        self.tree.move_node(ctx, &old, &new).await
    }

    pub async fn delete(&self, ctx: &RequestContext, reference: &Reference) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.delete).await?;
        node.check_lock(ctx).await?;
        self.tree.delete(ctx, &node).await
    }

    // ---- content ----

    pub async fn download(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<BlobReader> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists || node.is_processing().await {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.initiate_file_download).await?;
        self.tree.read_blob(&node).await
    }

    // ---- locks ----

    pub async fn get_lock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<Option<LockInfo>> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.initiate_file_download).await?;
        node.read_lock().await
    }

    pub async fn set_lock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        lock: &LockInfo,
    ) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.initiate_file_upload).await?;
        node.set_lock(ctx, lock).await
    }

    pub async fn refresh_lock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        lock: &LockInfo,
        existing_lock_id: &str,
    ) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.initiate_file_upload).await?;
        node.refresh_lock(ctx, lock, existing_lock_id).await
    }

    pub async fn unlock(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        lock: &LockInfo,
    ) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.initiate_file_upload).await?;
        node.unlock(ctx, lock).await
    }

    // ---- grants ----

    pub async fn add_grant(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        grant: &Grant,
    ) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.add_grant).await?;
        node.check_lock(ctx).await?;
        node.set_grant(grant).await?;
        self.propagate_from_parent(&node).await
    }

    pub async fn remove_grant(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        grantee: &Grantee,
    ) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.remove_grant).await?;
        node.check_lock(ctx).await?;
        node.remove_grant(grantee).await?;
        self.propagate_from_parent(&node).await
    }

    /// Bump tree mtimes for an attribute-only change: the climb starts
    /// at the first directory ancestor so file nodes never grow
    /// aggregate attributes.
    async fn propagate_from_parent(&self, node: &Node) -> FsResult<()> {
        let start = if node.is_space_root() || node.is_dir() {
            node.clone()
        } else {
            self.lookup
                .node_from_id(&node.space_id, &node.parent_id)
                .await?
        };
        self.tree.propagate(&start, 0, &Utc::now()).await
    }

    pub async fn list_grants(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<Vec<Grant>> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.list_grants).await?;
        node.list_grants().await
    }

    // ---- recycle ----

    pub async fn list_recycle(
        &self,
        ctx: &RequestContext,
        space_id: &str,
    ) -> FsResult<Vec<RecycleItem>> {
        let root = self.lookup.node_from_id(space_id, space_id).await?;
        if !root.exists {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }
        self.require(ctx, &root, |p| p.list_recycle).await?;
        self.tree.list_recycle(ctx, space_id).await
    }

    pub async fn restore_recycle_item(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        key: &str,
        restore_ref: Option<&Reference>,
    ) -> FsResult<Node> {
        let root = self.lookup.node_from_id(space_id, space_id).await?;
        if !root.exists {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }
        self.require(ctx, &root, |p| p.restore_recycle_item).await?;

        let target = match restore_ref {
            Some(reference) => Some(self.resolve(ctx, reference).await?),
            None => None,
        };
        let item = self
            .tree
            .restore_recycle_item(ctx, space_id, key, target.as_ref())
            .await?;
        item.target_parent.check_lock(ctx).await?;

        let restored = self.tree.commit_restore(item).await?;
        self.stat_cache
            .remove_stat(&ctx.user.id, &restored.resource_id());
        Ok(restored)
    }

    pub async fn purge_recycle_item(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        key: &str,
    ) -> FsResult<()> {
        let root = self.lookup.node_from_id(space_id, space_id).await?;
        if !root.exists {
            return Err(FsError::NotFound(format!("space {}", space_id)));
        }
        self.require(ctx, &root, |p| p.purge_recycle).await?;

        let item = self.tree.purge_recycle_item(ctx, space_id, key).await?;
        self.tree.commit_purge(item).await
    }

    // ---- revisions ----

    pub async fn list_revisions(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<Vec<RevisionInfo>> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.list_file_versions).await?;
        self.tree.list_revisions(&node).await
    }

    pub async fn restore_revision(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        key: &str,
    ) -> FsResult<()> {
        let node = self.resolve(ctx, reference).await?;
        if !node.exists {
            return Err(FsError::NotFound(node.name.clone()));
        }
        self.require(ctx, &node, |p| p.restore_file_version).await?;
        node.check_lock(ctx).await?;
        self.tree.restore_revision(ctx, &node, key).await?;
        self.stat_cache
            .remove_stat(&ctx.user.id, &node.resource_id());
        Ok(())
    }

    // ---- uploads ----

    /// Start an upload session for a file reference. Returns the session
    /// id the client uses for chunk transfer and finish.
    pub async fn initiate_upload(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        declared_size: u64,
        mtime: Option<DateTime<Utc>>,
        headers: UploadHeaders,
    ) -> FsResult<String> {
        let node = self.resolve(ctx, reference).await?;
        if node.exists && node.is_dir() {
            return Err(FsError::InvalidArg(format!(
                "{} is a directory",
                node.name
            )));
        }
        let parent = self
            .lookup
            .node_from_id(&node.space_id, &node.parent_id)
            .await?;
        if !parent.exists {
            return Err(FsError::NotFound(format!("parent {}", node.parent_id)));
        }
        self.require(ctx, &node, |p| p.initiate_file_upload).await?;
        node.check_lock(ctx).await?;

        let session = self
            .uploads
            .new_session(ctx, &node, declared_size, mtime, headers)
            .await?;
        Ok(session.id().to_string())
    }

    /// Append bytes to the session's chunk buffer; returns the new
    /// offset for resumable transfer.
    pub async fn upload_chunk<R>(&self, session_id: &str, reader: &mut R) -> FsResult<u64>
    where
        R: tokio::io::AsyncRead + Unpin + ?Sized,
    {
        let mut session = self.uploads.get(session_id).await?;
        session.append_chunk(reader).await
    }

    /// Seal the session: verify the transfer is complete, run the
    /// pre-commit against the target node and hand the upload to
    /// post-processing.
    pub async fn finish_upload(&self, session_id: &str) -> FsResult<ResourceId> {
        let mut session = self.uploads.get(session_id).await?;
        if session.offset != session.record.declared_size {
            return Err(FsError::InvalidArg(format!(
                "upload {} incomplete: {} of {} bytes",
                session_id, session.offset, session.record.declared_size
            )));
        }

        let (cs_key, cs_value) = compute_checksum(&session.bin_path()).await?;
        let mut attrs = dfs_lib::Attributes::new();
        attrs.set_string(cs_key, cs_value);

        let node = match self.uploads.create_node_for_upload(&mut session, attrs).await {
            Ok(node) => node,
            Err(e) => {
                // Revert alone clears any processing status the failed
                // pre-commit stamped; the upload stays for a retry.
                self.uploads.cleanup(&session, true, true, false).await;
                return Err(e);
            }
        };

        info!(
            "upload {} committed, awaiting post-processing for node {}",
            session_id, node.id
        );
        let space_owner = node.owner().await.ok().flatten().unwrap_or_default();
        self.stream
            .publish(Event::BytesReceived(BytesReceived {
                upload_id: session_id.to_string(),
                space_owner,
                resource_id: node.resource_id(),
                filename: node.name.clone(),
                filesize: node.blob_size,
            }))
            .await?;
        Ok(node.resource_id())
    }
}
