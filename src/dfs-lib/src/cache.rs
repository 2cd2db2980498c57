use std::collections::HashMap;
use std::sync::RwLock;

use crate::ResourceId;

/// Gateway-side stat cache, keyed per identity. The engine only ever
/// invalidates; population happens at the RPC boundary.
pub trait StatCache: Send + Sync {
    fn put_stat(&self, user_id: &str, id: &ResourceId, etag: String);
    fn get_stat(&self, user_id: &str, id: &ResourceId) -> Option<String>;
    fn remove_stat(&self, user_id: &str, id: &ResourceId);
}

#[derive(Default)]
pub struct MemoryStatCache {
    entries: RwLock<HashMap<(String, ResourceId), String>>,
}

impl MemoryStatCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatCache for MemoryStatCache {
    fn put_stat(&self, user_id: &str, id: &ResourceId, etag: String) {
        let mut entries = self.entries.write().unwrap();
        entries.insert((user_id.to_string(), id.clone()), etag);
    }

    fn get_stat(&self, user_id: &str, id: &ResourceId) -> Option<String> {
        let entries = self.entries.read().unwrap();
        entries.get(&(user_id.to_string(), id.clone())).cloned()
    }

    fn remove_stat(&self, user_id: &str, id: &ResourceId) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(&(user_id.to_string(), id.clone()));
    }
}
