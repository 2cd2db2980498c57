use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{FsResult, Reference, ResourceId, User};

/// Verdict of the out-of-band post-processing pipeline for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostprocessingOutcome {
    Continue,
    Abort,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocessingFinished {
    pub upload_id: String,
    /// None when the producer emitted an outcome this engine does not know;
    /// consumers treat it as abort.
    pub outcome: Option<PostprocessingOutcome>,
    pub executing_user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirusscanFinished {
    /// Empty for on-demand scans of an already committed resource.
    #[serde(default)]
    pub upload_id: String,
    pub resource_id: Option<ResourceId>,
    pub outcome: Option<PostprocessingOutcome>,
    pub description: String,
    pub scandate: DateTime<Utc>,
    pub executing_user: User,
    #[serde(default)]
    pub error_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReady {
    pub upload_id: String,
    pub failed: bool,
    pub executing_user: User,
    pub file_ref: Reference,
}

/// Emitted when an upload is committed and handed to post-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BytesReceived {
    pub upload_id: String,
    pub space_owner: User,
    pub resource_id: ResourceId,
    pub filename: String,
    pub filesize: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PostprocessingFinished(PostprocessingFinished),
    VirusscanFinished(VirusscanFinished),
    UploadReady(UploadReady),
    BytesReceived(BytesReceived),
}

/// Durable event stream boundary. Delivery is at-least-once; consumers
/// must be idempotent.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn publish(&self, event: Event) -> FsResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// Broadcast-backed stream for single-process deployments and tests.
pub struct MemoryEventStream {
    tx: broadcast::Sender<Event>,
}

impl MemoryEventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for MemoryEventStream {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn publish(&self, event: Event) -> FsResult<()> {
        // A send error only means nobody is subscribed right now.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
