mod grants;
mod locks;
mod lookup;
mod node;
mod path_cache;


pub use grants::{GrantPermissions, PermissionsChecker};
pub use locks::LockInfo;
pub use lookup::{Lookup, REVISION_DELIMITER, TRASH_DELIMITER};
pub use node::{validate_name, Node, ResourceInfo};
