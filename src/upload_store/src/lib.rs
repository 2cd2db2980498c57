mod session;
mod store;


pub use session::{
    SessionRecord, UploadHeaders, UploadSession, META_SIZE_DIFF, META_VERSIONS_PATH,
};
pub use store::{compute_checksum, SessionStore};
