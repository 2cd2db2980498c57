use std::collections::HashMap;
use std::sync::Arc;

/// Default maximum number of cached entries.
const DEFAULT_MAX_ENTRIES: usize = 10000;

type EntryId = u64;
type Key = (String, String);

struct CacheEntry {
    path: Arc<String>,
    entry_id: EntryId,
}

/// Process-wide cache of (space id, node id) → space-relative path.
/// Bounded with LRU eviction; move and delete must invalidate by prefix
/// because every descendant's path goes stale with its ancestor.
pub(crate) struct PathCache {
    entries: HashMap<Key, CacheEntry>,
    /// entry_id → key, ordered implicitly by id (lower = older).
    lru_map: HashMap<EntryId, Key>,
    max_entries: usize,
    next_entry_id: EntryId,
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl PathCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru_map: HashMap::new(),
            max_entries: max_entries.max(1),
            next_entry_id: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&mut self, space_id: &str, node_id: &str) -> Option<Arc<String>> {
        let key = (space_id.to_string(), node_id.to_string());
        let entry = self.entries.get_mut(&key)?;

        // Refresh LRU position.
        let old_id = entry.entry_id;
        let new_id = self.next_entry_id;
        self.next_entry_id += 1;
        entry.entry_id = new_id;
        let path = entry.path.clone();
        if let Some(k) = self.lru_map.remove(&old_id) {
            self.lru_map.insert(new_id, k);
        }
        Some(path)
    }

    pub(crate) fn insert(&mut self, space_id: &str, node_id: &str, path: String) {
        let key = (space_id.to_string(), node_id.to_string());
        if let Some(old) = self.entries.remove(&key) {
            self.lru_map.remove(&old.entry_id);
        }
        while self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        self.lru_map.insert(entry_id, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                path: Arc::new(path),
                entry_id,
            },
        );
    }

    pub(crate) fn remove(&mut self, space_id: &str, node_id: &str) {
        let key = (space_id.to_string(), node_id.to_string());
        if let Some(entry) = self.entries.remove(&key) {
            self.lru_map.remove(&entry.entry_id);
        }
    }

    /// Drop every entry in `space_id` whose path equals `prefix` or lives
    /// below it.
    pub(crate) fn invalidate_prefix(&mut self, space_id: &str, prefix: &str) {
        let stale: Vec<Key> = self
            .entries
            .iter()
            .filter(|((space, _), entry)| {
                space == space_id
                    && (entry.path.as_str() == prefix
                        || entry
                            .path
                            .strip_prefix(prefix)
                            .is_some_and(|rest| rest.starts_with('/')))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for (space, node) in stale {
            self.remove(&space, &node);
        }
    }

    fn evict_oldest(&mut self) {
        let oldest_id = match self.lru_map.keys().min().copied() {
            Some(id) => id,
            None => return,
        };
        if let Some(key) = self.lru_map.remove(&oldest_id) {
            self.entries.remove(&key);
        }
    }
}
