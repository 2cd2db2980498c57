use chrono::{DateTime, Utc};
use dfs_lib::{FsError, FsResult, RequestContext, LOCK_ATTR};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::node::Node;

/// Advisory lock on a node. The id is chosen by the client; expired
/// locks behave as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: String,
    pub user_id: String,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl LockInfo {
    pub fn is_expired(&self, now: &DateTime<Utc>) -> bool {
        self.expiration.map(|exp| exp <= *now).unwrap_or(false)
    }

    fn encode(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FsError::Internal(format!("encode lock: {}", e)))
    }

    fn decode(raw: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| FsError::Inconsistent(format!("decode lock: {}", e)))
    }
}

impl Node {
    /// The active lock, if any. Expired locks are lazily cleared.
    pub async fn read_lock(&self) -> FsResult<Option<LockInfo>> {
        let raw = match self
            .lookup()
            .backend()
            .get(&self.internal_path(), LOCK_ATTR)
            .await
        {
            Ok(raw) => raw,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let lock = LockInfo::decode(&raw)?;
        if lock.is_expired(&Utc::now()) {
            debug!("clearing expired lock {} on {}", lock.lock_id, self.id);
            let _ = self.remove_metadata_key(LOCK_ATTR).await;
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// Called at the top of every mutating operation: passes when the
    /// node is unlocked or the context carries the matching lock id.
    pub async fn check_lock(&self, ctx: &RequestContext) -> FsResult<()> {
        match self.read_lock().await? {
            None => Ok(()),
            Some(lock) if ctx.lock_id.as_deref() == Some(lock.lock_id.as_str()) => Ok(()),
            Some(lock) => Err(FsError::Locked(lock.lock_id)),
        }
    }

    pub async fn set_lock(&self, _ctx: &RequestContext, lock: &LockInfo) -> FsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(FsError::InvalidArg("missing lock id".to_string()));
        }
        if let Some(existing) = self.read_lock().await? {
            return Err(FsError::Locked(existing.lock_id));
        }
        self.set_metadata_key(LOCK_ATTR, lock.encode()?).await
    }

    /// Replace the lock; the caller must present the currently held id.
    pub async fn refresh_lock(
        &self,
        _ctx: &RequestContext,
        lock: &LockInfo,
        existing_lock_id: &str,
    ) -> FsResult<()> {
        if lock.lock_id.is_empty() {
            return Err(FsError::InvalidArg("missing lock id".to_string()));
        }
        let current = self
            .read_lock()
            .await?
            .ok_or_else(|| FsError::Aborted(format!("node {} is not locked", self.id)))?;
        if current.lock_id != existing_lock_id {
            return Err(FsError::Locked(current.lock_id));
        }
        self.set_metadata_key(LOCK_ATTR, lock.encode()?).await
    }

    pub async fn unlock(&self, ctx: &RequestContext, lock: &LockInfo) -> FsResult<()> {
        let current = self
            .read_lock()
            .await?
            .ok_or_else(|| FsError::Aborted(format!("node {} is not locked", self.id)))?;
        if current.lock_id != lock.lock_id {
            return Err(FsError::Locked(current.lock_id));
        }
        if current.user_id != ctx.user.id {
            return Err(FsError::PermissionDenied(format!(
                "lock on {} held by another user",
                self.id
            )));
        }
        self.remove_metadata_key(LOCK_ATTR).await
    }
}
