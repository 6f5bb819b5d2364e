// =============================================================================
// Cache/KV surface — read-through cache used by engines, read by consumers
// =============================================================================
//
// The core only ever needs get/set-with-ttl semantics (spec §6). A real
// deployment would back this with an external KV store; `InMemoryCache` is a
// drop-in that keeps the core fully runnable without one.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration);
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process cache with lazy expiry on read. Not shared across processes;
/// stands in for the external KV store described in spec §6.
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }

    fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut entries = self.entries.write();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", b"v".to_vec(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn fresh_entries_round_trip() {
        let cache = InMemoryCache::new();
        cache.set_with_ttl("k", b"v".to_vec(), Duration::from_secs(5));
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));
    }
}
