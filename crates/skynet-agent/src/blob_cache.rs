//! Short-TTL in-memory cache for raw attachment bytes.
//!
//! Keeps a normalized message's downloaded files available under a cache
//! key for the lifetime of the turn (and a little beyond, for retries),
//! without round-tripping through the platform to re-download them when a
//! tool like `transcribe_audio` needs the bytes directly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

const TTL_SECS: u64 = 600;
const MAX_ENTRIES: usize = 512;

struct Entry {
    bytes: Vec<u8>,
    inserted_at: Instant,
}

pub struct BlobCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl BlobCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: &str, bytes: &[u8]) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_ENTRIES {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                bytes: bytes.to_vec(),
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed().as_secs() >= TTL_SECS {
            entries.remove(key);
            return None;
        }
        Some(entry.bytes.clone())
    }
}

impl Default for BlobCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_roundtrips() {
        let cache = BlobCache::new();
        cache.insert("k1", b"hello");
        assert_eq!(cache.get("k1"), Some(b"hello".to_vec()));
    }

    #[test]
    fn missing_key_returns_none() {
        let cache = BlobCache::new();
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn eviction_keeps_entry_count_bounded() {
        let cache = BlobCache::new();
        for i in 0..(MAX_ENTRIES + 10) {
            cache.insert(&format!("k{i}"), b"x");
        }
        assert!(cache.entries.lock().unwrap().len() <= MAX_ENTRIES);
    }
}
