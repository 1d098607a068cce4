//! Unique names for test entities

use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a unique entity name with the given prefix.
///
/// Format: `{prefix}-{timestamp_ms}{counter}`, so the result still parses
/// as the same entity kind (`vpc-…`, `sg-…`) wherever prefixes matter.
///
/// # Example
///
/// ```
/// use mido_sync_test_utils::names::unique_name;
///
/// let vpc = unique_name("vpc");
/// assert!(vpc.starts_with("vpc-"));
/// ```
pub fn unique_name(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:x}{counter:04x}")
}

/// Deterministic, locally administered MAC address for test interface `n`
pub fn test_mac(n: u32) -> String {
    let [a, b, c, d] = n.to_be_bytes();
    format!("d0:0d:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_unique() {
        let a = unique_name("sg");
        let b = unique_name("sg");
        assert_ne!(a, b);
        assert!(a.starts_with("sg-"));
    }

    #[test]
    fn test_mac_format() {
        assert_eq!(test_mac(1), "d0:0d:00:00:00:01");
        assert_eq!(test_mac(0x0102_0304), "d0:0d:01:02:03:04");
    }
}
