use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use dfs_lib::{shard_id, shard_space_id, FsError, FsResult, Reference, RequestContext};
use meta_store::MetadataBackend;

use crate::node::Node;
use crate::path_cache::PathCache;

/// Delimiter between a node id and the revision timestamp in the name of
/// a version entry.
pub const REVISION_DELIMITER: &str = ".REV.";
/// Delimiter between a node id and the deletion timestamp in the name of
/// a trashed entry.
pub const TRASH_DELIMITER: &str = ".T.";

struct LookupInner {
    root: PathBuf,
    backend: Arc<dyn MetadataBackend>,
    path_cache: Mutex<PathCache>,
}

/// Bidirectional mapping between opaque node ids and on-disk paths.
#[derive(Clone)]
pub struct Lookup {
    inner: Arc<LookupInner>,
}

impl Lookup {
    pub fn new(root: impl Into<PathBuf>, backend: Arc<dyn MetadataBackend>) -> Self {
        Self {
            inner: Arc::new(LookupInner {
                root: root.into(),
                backend,
                path_cache: Mutex::new(PathCache::default()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn MetadataBackend> {
        &self.inner.backend
    }

    pub fn spaces_dir(&self) -> PathBuf {
        self.inner.root.join("spaces")
    }

    fn space_dir(&self, space_id: &str) -> PathBuf {
        self.spaces_dir().join(shard_space_id(space_id))
    }

    fn nodes_dir(&self, space_id: &str) -> PathBuf {
        self.space_dir(space_id).join("nodes")
    }

    pub fn trash_dir(&self, space_id: &str) -> PathBuf {
        self.space_dir(space_id).join("trash")
    }

    /// Deterministic on-disk location of a node entry.
    pub fn internal_path(&self, space_id: &str, node_id: &str) -> PathBuf {
        self.nodes_dir(space_id).join(shard_id(node_id))
    }

    /// Location of a version entry, named after the live node plus the
    /// revision timestamp.
    pub fn version_path(&self, space_id: &str, node_id: &str, revision: &str) -> PathBuf {
        let mut os = self
            .internal_path(space_id, node_id)
            .into_os_string();
        os.push(REVISION_DELIMITER);
        os.push(revision);
        PathBuf::from(os)
    }

    /// The relative symlink target linking a child into its parent's
    /// entry directory. Relative so renames of ancestors keep it valid.
    pub fn child_link_target(&self, parent_id: &str, child_id: &str) -> PathBuf {
        let ups = shard_id(parent_id).split('/').count();
        let mut target = PathBuf::new();
        for _ in 0..ups {
            target.push("..");
        }
        target.join(shard_id(child_id))
    }

    /// Recover a node id from a child symlink target by stripping the
    /// leading parent directories and rejoining the sharded components.
    pub fn node_id_from_link(target: &Path) -> FsResult<String> {
        let mut id = String::new();
        for component in target.components() {
            match component {
                Component::ParentDir => continue,
                Component::Normal(part) => {
                    id.push_str(part.to_str().ok_or_else(|| {
                        FsError::Inconsistent(format!("non-utf8 link target {:?}", target))
                    })?);
                }
                _ => {
                    return Err(FsError::Inconsistent(format!(
                        "unexpected link target {:?}",
                        target
                    )))
                }
            }
        }
        if id.is_empty() {
            return Err(FsError::Inconsistent(format!(
                "empty link target {:?}",
                target
            )));
        }
        Ok(id)
    }

    pub async fn node_from_id(&self, space_id: &str, node_id: &str) -> FsResult<Node> {
        Node::read_node(self.clone(), space_id, node_id).await
    }

    /// Resolve a client reference: the anchor resource plus an optional
    /// relative path. Intermediate segments must exist; the final segment
    /// may resolve to a non-existing handle so callers can create it.
    pub async fn node_from_resource(
        &self,
        _ctx: &RequestContext,
        reference: &Reference,
    ) -> FsResult<Node> {
        let mut node = self
            .node_from_id(&reference.resource_id.space_id, &reference.resource_id.opaque_id)
            .await?;

        let segments: Vec<&str> = reference
            .path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        for segment in segments {
            if !node.exists {
                return Err(FsError::NotFound(format!(
                    "{}/{}",
                    node.parent_id, node.name
                )));
            }
            node = node.child(segment).await?;
        }
        Ok(node)
    }

    /// Space-relative path of a node, built by walking parent links up to
    /// the space root. Results are cached; ancestors found in the cache
    /// short-circuit the walk.
    pub async fn path(&self, node: &Node) -> FsResult<String> {
        if node.is_space_root() {
            return Ok("/".to_string());
        }
        if let Some(cached) = self.cache_get(&node.space_id, &node.id) {
            return Ok(cached.as_ref().clone());
        }

        let mut segments = vec![node.name.clone()];
        let mut parent_id = node.parent_id.clone();
        let mut base = String::new();
        while parent_id != node.space_id {
            if let Some(cached) = self.cache_get(&node.space_id, &parent_id) {
                base = cached.as_ref().clone();
                break;
            }
            let parent = self.node_from_id(&node.space_id, &parent_id).await?;
            if !parent.exists {
                return Err(FsError::Inconsistent(format!(
                    "dangling parent {} while resolving path of {}",
                    parent_id, node.id
                )));
            }
            segments.push(parent.name.clone());
            parent_id = parent.parent_id.clone();
        }

        segments.reverse();
        let path = format!("{}/{}", base.trim_end_matches('/'), segments.join("/"));
        self.cache_insert(&node.space_id, &node.id, path.clone());
        Ok(path)
    }

    fn cache_get(&self, space_id: &str, node_id: &str) -> Option<Arc<String>> {
        self.inner.path_cache.lock().unwrap().get(space_id, node_id)
    }

    fn cache_insert(&self, space_id: &str, node_id: &str, path: String) {
        self.inner
            .path_cache
            .lock()
            .unwrap()
            .insert(space_id, node_id, path);
    }

    /// Mandatory after move or delete: the node's own entry and every
    /// cached descendant path are stale.
    pub fn invalidate_cached_subtree(&self, space_id: &str, node_id: &str, old_path: &str) {
        let mut cache = self.inner.path_cache.lock().unwrap();
        cache.remove(space_id, node_id);
        if !old_path.is_empty() {
            cache.invalidate_prefix(space_id, old_path);
        }
    }

    /// Drop a single node's cached path, for nodes that never had
    /// descendants (e.g. a reverted upload target).
    pub fn forget_cached(&self, space_id: &str, node_id: &str) {
        self.inner
            .path_cache
            .lock()
            .unwrap()
            .remove(space_id, node_id);
    }
}
