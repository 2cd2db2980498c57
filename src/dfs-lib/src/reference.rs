use serde::{Deserialize, Serialize};

use crate::{FsError, FsResult};

/// A stable address of a node: the owning space plus the node's opaque id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub space_id: String,
    pub opaque_id: String,
}

impl ResourceId {
    pub fn new(space_id: impl Into<String>, opaque_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            opaque_id: opaque_id.into(),
        }
    }

    /// The root resource of a space is the space id itself.
    pub fn space_root(space_id: impl Into<String>) -> Self {
        let space_id = space_id.into();
        Self {
            opaque_id: space_id.clone(),
            space_id,
        }
    }
}

/// A client-facing reference: a resource id plus an optional path relative
/// to that resource. An empty path addresses the resource itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub path: String,
}

impl Reference {
    pub fn id(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            path: String::new(),
        }
    }

    pub fn relative(resource_id: ResourceId, path: impl Into<String>) -> Self {
        Self {
            resource_id,
            path: path.into(),
        }
    }

    pub fn is_relative(&self) -> bool {
        !self.path.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
    Reference,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Dir => "dir",
            NodeType::Reference => "reference",
        }
    }

    pub fn from_attr(value: &str) -> FsResult<Self> {
        match value {
            "file" => Ok(NodeType::File),
            "dir" => Ok(NodeType::Dir),
            "reference" => Ok(NodeType::Reference),
            other => Err(FsError::Inconsistent(format!(
                "unknown node type: {}",
                other
            ))),
        }
    }
}

/// The identity a request acts as. Resolved by the external identity
/// service before the request reaches the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub idp: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}

/// Request-scoped context carried into every engine operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: User,
    /// Lock id presented by the client, checked against node locks.
    pub lock_id: Option<String>,
}

impl RequestContext {
    pub fn new(user: User) -> Self {
        Self {
            user,
            lock_id: None,
        }
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }
}
