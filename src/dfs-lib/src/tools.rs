use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::{FsError, FsResult};

/// Mtime attributes and version entry names use RFC 3339 with nanoseconds.
pub fn format_mtime(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_mtime(raw: &str) -> FsResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FsError::InvalidArg(format!("bad timestamp {}: {}", raw, e)))
}

/// The etag of a node is derived from its id and mtime, quoted the way
/// HTTP conditional headers expect it.
pub fn calculate_etag(node_id: &str, mtime: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(format_mtime(mtime).as_bytes());
    let digest = hasher.finalize();
    format!("\"{}\"", hex::encode(&digest[..16]))
}

/// Shard an opaque id into path components: up to four two-character
/// levels plus the remainder, e.g. `4c51…` → `4c/51/…`. Short ids simply
/// produce fewer levels; the mapping stays injective because the component
/// count differs.
pub fn shard_id(id: &str) -> String {
    shard(id, 4, 2)
}

/// Space ids are sharded one level deep.
pub fn shard_space_id(id: &str) -> String {
    shard(id, 1, 2)
}

fn shard(id: &str, levels: usize, width: usize) -> String {
    let chars: Vec<char> = id.chars().collect();
    let mut out = String::with_capacity(id.len() + levels);
    let mut pos = 0;
    for _ in 0..levels {
        if chars.len() - pos <= width {
            break;
        }
        out.extend(&chars[pos..pos + width]);
        out.push('/');
        pos += width;
    }
    out.extend(&chars[pos..]);
    out
}
