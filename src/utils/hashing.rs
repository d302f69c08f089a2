use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte payload.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Short stable key for a string (dedup keys, query suffixes, cache shards).
pub fn short_hash(text: &str, len: usize) -> String {
    let full = content_hash(text.as_bytes());
    full[..len.min(full.len())].to_string()
}
