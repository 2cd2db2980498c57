use serde::{Deserialize, Serialize};

use crate::{FsError, FsResult, User};

/// The capability set a principal holds on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    pub create_container: bool,
    pub initiate_file_upload: bool,
    pub initiate_file_download: bool,
    pub delete: bool,
    pub move_node: bool,
    pub list_container: bool,
    pub list_recycle: bool,
    pub restore_recycle_item: bool,
    pub purge_recycle: bool,
    pub list_grants: bool,
    pub add_grant: bool,
    pub remove_grant: bool,
    pub deny_grant: bool,
    pub get_quota: bool,
    pub get_path: bool,
    pub stat: bool,
    pub list_file_versions: bool,
    pub restore_file_version: bool,
}

impl PermissionSet {
    /// Everything. Held by the space owner.
    pub fn full() -> Self {
        Self {
            create_container: true,
            initiate_file_upload: true,
            initiate_file_download: true,
            delete: true,
            move_node: true,
            list_container: true,
            list_recycle: true,
            restore_recycle_item: true,
            purge_recycle: true,
            list_grants: true,
            add_grant: true,
            remove_grant: true,
            deny_grant: true,
            get_quota: true,
            get_path: true,
            stat: true,
            list_file_versions: true,
            restore_file_version: true,
        }
    }

    /// Read-only view: stat, list, download, versions.
    pub fn viewer() -> Self {
        Self {
            initiate_file_download: true,
            list_container: true,
            get_path: true,
            stat: true,
            list_file_versions: true,
            ..Default::default()
        }
    }

    /// Viewer plus mutating file operations.
    pub fn editor() -> Self {
        Self {
            create_container: true,
            initiate_file_upload: true,
            delete: true,
            move_node: true,
            list_recycle: true,
            restore_recycle_item: true,
            restore_file_version: true,
            ..Self::viewer()
        }
    }

    /// Merge by logical OR, the way grants from multiple matching
    /// grantees combine.
    pub fn add(&mut self, other: &PermissionSet) {
        self.create_container |= other.create_container;
        self.initiate_file_upload |= other.initiate_file_upload;
        self.initiate_file_download |= other.initiate_file_download;
        self.delete |= other.delete;
        self.move_node |= other.move_node;
        self.list_container |= other.list_container;
        self.list_recycle |= other.list_recycle;
        self.restore_recycle_item |= other.restore_recycle_item;
        self.purge_recycle |= other.purge_recycle;
        self.list_grants |= other.list_grants;
        self.add_grant |= other.add_grant;
        self.remove_grant |= other.remove_grant;
        self.deny_grant |= other.deny_grant;
        self.get_quota |= other.get_quota;
        self.get_path |= other.get_path;
        self.stat |= other.stat;
        self.list_file_versions |= other.list_file_versions;
        self.restore_file_version |= other.restore_file_version;
    }

    pub fn is_empty(&self) -> bool {
        *self == PermissionSet::default()
    }
}

/// The principal a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grantee {
    User(String),
    Group(String),
}

impl Grantee {
    /// Attribute-name form used as the grant xattr suffix.
    pub fn principal(&self) -> String {
        match self {
            Grantee::User(id) => format!("u:{}", id),
            Grantee::Group(id) => format!("g:{}", id),
        }
    }

    pub fn from_principal(principal: &str) -> FsResult<Self> {
        match principal.split_once(':') {
            Some(("u", id)) if !id.is_empty() => Ok(Grantee::User(id.to_string())),
            Some(("g", id)) if !id.is_empty() => Ok(Grantee::Group(id.to_string())),
            _ => Err(FsError::InvalidArg(format!(
                "malformed grant principal: {}",
                principal
            ))),
        }
    }

    pub fn matches(&self, user: &User) -> bool {
        match self {
            Grantee::User(id) => *id == user.id,
            Grantee::Group(id) => user.groups.iter().any(|g| g == id),
        }
    }
}

/// One ACL entry as stored in a grant attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub grantee: Grantee,
    pub permissions: PermissionSet,
}

impl Grant {
    pub fn encode(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FsError::Internal(format!("encode grant: {}", e)))
    }

    pub fn decode(raw: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| FsError::Inconsistent(format!("decode grant: {}", e)))
    }
}
