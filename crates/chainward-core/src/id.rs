//! Short random-looking identifiers for nodes and alerts.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate `<prefix>-<12 hex chars>`.
///
/// The suffix is a SHA-256 digest over the prefix, the current time, the
/// process id and a process-wide counter, so ids generated in the same
/// nanosecond still differ.
pub fn generate_id(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(seq.to_le_bytes());
    let digest = hasher.finalize();

    format!("{prefix}-{}", hex::encode(&digest[..6]))
}
