//! Keyed storage
//!
//! An in-memory expiring map behind a thin facade. The facade is the only
//! write path into the map, which keeps client writes and replicated writes
//! on one code path. Expiry is lazy: an expired entry is dropped the first
//! time it is observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// One stored value with its optional expiry deadline
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// Shared key/value store with per-entry TTLs
#[derive(Debug, Clone, Default)]
pub struct Store {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`. A zero `ttl` means the entry never expires.
    pub fn set(&self, key: String, value: Bytes, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, Entry { value, expires_at });
    }

    /// Get the live value for `key`, removing it if it has expired
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|deadline| deadline <= Instant::now()) {
                    entries.remove(key);
                    None
                } else {
                    Some(entry.value.clone())
                }
            }
            None => None,
        }
    }

    /// Number of entries currently held, including not-yet-collected expired
    /// ones
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let store = Store::new();
        store.set("foo".into(), Bytes::from("bar"), Duration::ZERO);
        assert_eq!(store.get("foo"), Some(Bytes::from("bar")));
    }

    #[test]
    fn test_get_missing_key() {
        let store = Store::new();
        assert_eq!(store.get("nope"), None);
    }

    #[test]
    fn test_set_overwrites() {
        let store = Store::new();
        store.set("k".into(), Bytes::from("one"), Duration::ZERO);
        store.set("k".into(), Bytes::from("two"), Duration::ZERO);
        assert_eq!(store.get("k"), Some(Bytes::from("two")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let store = Store::new();
        store.set("k".into(), Bytes::from("v"), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("k"), Some(Bytes::from("v")));
    }

    #[test]
    fn test_expired_entry_reads_as_miss_and_is_removed() {
        let store = Store::new();
        store.set("k".into(), Bytes::from("v"), Duration::from_millis(10));
        assert_eq!(store.get("k"), Some(Bytes::from("v")));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Store::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.set(
                            format!("k{i}-{j}"),
                            Bytes::from(format!("v{j}")),
                            Duration::ZERO,
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8 * 50);
        assert_eq!(store.get("k3-49"), Some(Bytes::from("v49")));
    }
}
