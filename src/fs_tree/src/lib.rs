mod revisions;
mod trash;
mod tree;

#[cfg(test)]
mod revisions_tests;

pub use revisions::{is_revision_attr, RevisionInfo};
pub use trash::{PurgeItem, RecycleItem, RestoreItem};
pub use tree::Tree;
