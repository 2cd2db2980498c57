use std::sync::Arc;

use chrono::Utc;
use dfs_lib::{
    format_mtime, Event, FsError, PostprocessingFinished, PostprocessingOutcome, Reference,
    RequestContext, ResourceId, UploadReady, VirusscanFinished,
};
use fs_node::{Node, REVISION_DELIMITER};
use log::{error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::engine::DfsEngine;

/// Bounded set of workers draining the durable event stream. Delivery
/// is at-least-once and every worker sees every event, so outcomes are
/// deduplicated on the engine before any side effect runs.
pub struct Postprocessing {
    handles: Vec<JoinHandle<()>>,
}

impl Postprocessing {
    pub(crate) fn start(engine: Arc<DfsEngine>, workers: usize) -> Self {
        let mut handles = Vec::new();
        for worker in 0..workers.max(1) {
            let engine = engine.clone();
            let mut rx = engine.stream.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(Event::PostprocessingFinished(ev)) => {
                            engine.handle_postprocessing_finished(ev).await;
                        }
                        Ok(Event::VirusscanFinished(ev)) => {
                            engine.handle_virusscan_finished(ev).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                "postprocessing worker {} lagged, {} events skipped",
                                worker, skipped
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        Self { handles }
    }
}

impl Drop for Postprocessing {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl DfsEngine {
    fn claim(&self, key: String) -> bool {
        self.processed.lock().unwrap().insert(key)
    }

    fn unclaim(&self, key: &str) {
        self.processed.lock().unwrap().remove(key);
    }

    /// Drive one upload to its terminal state. Errors are logged with
    /// the upload id and steer into the abort branch; they never crash
    /// the worker.
    pub(crate) async fn handle_postprocessing_finished(&self, ev: PostprocessingFinished) {
        let claim_key = format!("pp:{}", ev.upload_id);
        if !self.claim(claim_key.clone()) {
            info!("upload {}: duplicate postprocessing event ignored", ev.upload_id);
            return;
        }

        let session = match self.uploads.get(&ev.upload_id).await {
            Ok(session) => session,
            Err(e) => {
                error!("upload {}: could not load session: {}", ev.upload_id, e);
                // No side effect happened; a replay may still succeed.
                self.unclaim(&claim_key);
                return;
            }
        };
        let record = session.record.clone();
        let node = match self
            .lookup
            .node_from_id(&record.space_id, &record.node_id)
            .await
        {
            Ok(node) if node.exists => node,
            Ok(_) => {
                error!("upload {}: target node {} is gone", ev.upload_id, record.node_id);
                self.uploads.cleanup(&session, false, false, false).await;
                return;
            }
            Err(e) => {
                error!("upload {}: could not read node: {}", ev.upload_id, e);
                self.unclaim(&claim_key);
                return;
            }
        };

        let outcome = ev.outcome.unwrap_or_else(|| {
            error!("upload {}: unknown outcome, aborting", ev.upload_id);
            PostprocessingOutcome::Abort
        });
        let (failed, keep_upload) = match outcome {
            PostprocessingOutcome::Continue => {
                match self.uploads.finalize(&session, &node).await {
                    Ok(()) => (false, false),
                    Err(e) => {
                        error!("upload {}: could not finalize: {}", ev.upload_id, e);
                        (true, true)
                    }
                }
            }
            PostprocessingOutcome::Abort => (true, true),
            PostprocessingOutcome::Delete => (true, false),
        };

        self.uploads
            .cleanup(&session, failed, keep_upload, true)
            .await;

        // Fold the committed bytes into the ancestor chain; aborted
        // uploads were reverted and only need the tree mtime bumped.
        match self
            .lookup
            .node_from_id(&record.space_id, &record.parent_id)
            .await
        {
            Ok(parent) if parent.exists => {
                let size_diff = if failed { 0 } else { session.size_diff() };
                if let Err(e) = self.tree.propagate(&parent, size_diff, &Utc::now()).await {
                    error!("upload {}: could not propagate: {}", ev.upload_id, e);
                }
            }
            Ok(_) => warn!("upload {}: parent {} is gone", ev.upload_id, record.parent_id),
            Err(e) => error!("upload {}: could not read parent: {}", ev.upload_id, e),
        }

        self.stat_cache.remove_stat(
            &ev.executing_user.id,
            &ResourceId::new(record.space_id.clone(), record.node_id.clone()),
        );

        let ready = UploadReady {
            upload_id: ev.upload_id.clone(),
            failed,
            executing_user: ev.executing_user,
            file_ref: Reference::id(ResourceId::new(record.space_id, record.node_id)),
        };
        if let Err(e) = self.stream.publish(Event::UploadReady(ready)).await {
            error!("upload {}: could not publish UploadReady: {}", ev.upload_id, e);
        }
    }

    pub(crate) async fn handle_virusscan_finished(&self, ev: VirusscanFinished) {
        if !ev.error_msg.is_empty() {
            warn!("virus scan reported an error, ignoring: {}", ev.error_msg);
            return;
        }

        let claim_key = match (&ev.upload_id, &ev.resource_id) {
            (id, _) if !id.is_empty() => format!("scan:{}:{}", id, format_mtime(&ev.scandate)),
            (_, Some(resource)) => format!(
                "scan:{}:{}:{}",
                resource.space_id,
                resource.opaque_id,
                format_mtime(&ev.scandate)
            ),
            _ => {
                warn!("virus scan event without upload or resource id");
                return;
            }
        };
        if !self.claim(claim_key) {
            return;
        }

        if let Err(e) = self.apply_scan_result(&ev).await {
            error!("virus scan handling failed: {}", e);
        }
    }

    async fn apply_scan_result(&self, ev: &VirusscanFinished) -> Result<(), FsError> {
        let ctx = RequestContext::new(ev.executing_user.clone());

        let node = if ev.upload_id.is_empty() {
            // On-demand scan of a committed resource.
            let resource = ev
                .resource_id
                .as_ref()
                .ok_or_else(|| FsError::InvalidArg("scan event without resource id".to_string()))?;
            let node = self
                .lookup
                .node_from_id(&resource.space_id, &resource.opaque_id)
                .await?;
            if !node.exists {
                return Err(FsError::NotFound(resource.opaque_id.clone()));
            }

            if ev.outcome == Some(PostprocessingOutcome::Delete) {
                self.remove_infected(&ctx, &node).await?;
                self.stat_cache.remove_stat(&ev.executing_user.id, resource);
                return Ok(());
            }
            node
        } else {
            let session = self.uploads.get(&ev.upload_id).await?;
            let node = self
                .lookup
                .node_from_id(&session.record.space_id, &session.record.node_id)
                .await?;
            if !node.exists {
                return Err(FsError::NotFound(session.record.node_id.clone()));
            }
            node
        };

        node.set_scan_data(&ev.description, &ev.scandate).await?;
        self.stat_cache
            .remove_stat(&ev.executing_user.id, &node.resource_id());
        Ok(())
    }

    /// The scanner wants an infected file gone. With prior revisions the
    /// newest one becomes live again and the infected revision is
    /// dropped; without any, the file is trashed and purged.
    async fn remove_infected(&self, ctx: &RequestContext, node: &Node) -> Result<(), FsError> {
        let revisions = self.tree.list_revisions(node).await?;
        match revisions.last() {
            None => {
                info!("removing infected node {} without revisions", node.id);
                self.tree.delete(ctx, node).await?;
                let item = self
                    .tree
                    .purge_recycle_item(ctx, &node.space_id, &node.id)
                    .await?;
                self.tree.commit_purge(item).await
            }
            Some(newest) => {
                info!(
                    "restoring {} onto infected node {}",
                    newest.key, node.id
                );
                // The restore preserves the infected live state as a new
                // revision keyed by its mtime; that is the one to drop.
                let infected_mtime = node.get_mtime().await?;
                self.tree.restore_revision(ctx, node, &newest.key).await?;
                let infected_key = format!(
                    "{}{}{}",
                    node.id,
                    REVISION_DELIMITER,
                    format_mtime(&infected_mtime)
                );
                let restored = self
                    .lookup
                    .node_from_id(&node.space_id, &node.id)
                    .await?;
                self.tree
                    .delete_revision(ctx, &restored, &infected_key)
                    .await
            }
        }
    }
}
