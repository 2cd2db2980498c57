use async_trait::async_trait;
use dfs_lib::{
    FsError, FsResult, Grant, Grantee, PermissionSet, RequestContext, GRANT_PREFIX,
};
use log::warn;

use crate::lookup::Lookup;
use crate::node::Node;

impl Node {
    pub async fn set_grant(&self, grant: &Grant) -> FsResult<()> {
        let key = format!("{}{}", GRANT_PREFIX, grant.grantee.principal());
        self.set_metadata_key(&key, grant.encode()?).await
    }

    pub async fn remove_grant(&self, grantee: &Grantee) -> FsResult<()> {
        let key = format!("{}{}", GRANT_PREFIX, grantee.principal());
        // Distinguish "no such grant" from a successful removal.
        self.lookup()
            .backend()
            .get(&self.internal_path(), &key)
            .await?;
        self.remove_metadata_key(&key).await
    }

    pub async fn list_grants(&self) -> FsResult<Vec<Grant>> {
        let attrs = self
            .lookup()
            .backend()
            .get_all(&self.internal_path())
            .await?;
        let mut grants = Vec::new();
        for (key, value) in attrs.iter() {
            if !key.starts_with(GRANT_PREFIX) {
                continue;
            }
            match Grant::decode(value) {
                Ok(grant) => grants.push(grant),
                Err(e) => warn!("skipping malformed grant {} on {}: {}", key, self.id, e),
            }
        }
        Ok(grants)
    }

    /// The capability set the context user holds here, assembled from
    /// the grants on this node and its ancestors.
    pub async fn permission_set(&self, ctx: &RequestContext) -> FsResult<PermissionSet> {
        GrantPermissions::new(self.lookup().clone())
            .assemble_permissions(ctx, self)
            .await
    }

    /// Grants on this node that apply to the context user, merged by OR.
    async fn matching_grants(&self, ctx: &RequestContext) -> FsResult<PermissionSet> {
        let mut set = PermissionSet::default();
        for grant in self.list_grants().await? {
            if grant.grantee.matches(&ctx.user) {
                set.add(&grant.permissions);
            }
        }
        Ok(set)
    }
}

/// Boundary interface for permission checks; supplied at engine
/// construction so tests can stub it out.
#[async_trait]
pub trait PermissionsChecker: Send + Sync {
    async fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node: &Node,
    ) -> FsResult<PermissionSet>;

    async fn has_permission(
        &self,
        ctx: &RequestContext,
        node: &Node,
        check: for<'a> fn(&'a PermissionSet) -> bool,
    ) -> FsResult<bool> {
        Ok(check(&self.assemble_permissions(ctx, node).await?))
    }
}

/// Default checker: the space owner holds everything; everyone else gets
/// the OR of grant entries on the node and its ancestors.
pub struct GrantPermissions {
    lookup: Lookup,
}

impl GrantPermissions {
    pub fn new(lookup: Lookup) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl PermissionsChecker for GrantPermissions {
    async fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node: &Node,
    ) -> FsResult<PermissionSet> {
        if let Some(owner) = node.owner().await? {
            if owner.id == ctx.user.id {
                return Ok(PermissionSet::full());
            }
        }

        let mut set = PermissionSet::default();
        // A handle for a node that does not exist yet inherits from its
        // parent chain.
        let mut current = if node.exists {
            node.clone()
        } else {
            let parent = self
                .lookup
                .node_from_id(&node.space_id, &node.parent_id)
                .await?;
            if !parent.exists {
                return Ok(set);
            }
            parent
        };

        loop {
            set.add(&current.matching_grants(ctx).await?);
            if current.is_space_root() {
                break;
            }
            let parent = self
                .lookup
                .node_from_id(&current.space_id, &current.parent_id)
                .await?;
            if !parent.exists {
                return Err(FsError::Inconsistent(format!(
                    "dangling parent {} of {}",
                    current.parent_id, current.id
                )));
            }
            current = parent;
        }
        Ok(set)
    }
}
