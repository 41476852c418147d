use chrono::Utc;
use rand::Rng;
use sha1::{Digest, Sha1};

/// Hex SHA-1 over a random salt, the current time and `parts`.
///
/// Used for queue ids and worker ids. Collision resistant, not secret.
pub fn unique_id(parts: &[&str]) -> String {
    let salt: u64 = rand::thread_rng().gen();
    let now = Utc::now();

    let mut hasher = Sha1::new();
    hasher.update(salt.to_be_bytes());
    hasher.update(now.timestamp().to_be_bytes());
    hasher.update(now.timestamp_subsec_nanos().to_be_bytes());
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Directory fan-out prefix: the first two characters of an id.
pub fn shard(id: &str) -> &str {
    id.get(..2).unwrap_or(id)
}
