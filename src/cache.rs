//! cache.rs — key-value memoization collaborator (TTL-capable).
//!
//! The engine treats the cache as strictly optional: absence, expiry and
//! read timeouts all look like a miss. Values are opaque serialized strings;
//! the cache never understands what it stores.
//!
//! Keys follow the fixed scheme:
//! - `features:<phoneHash>`
//! - `ml_result:<phoneHash>`
//! - `whitelist:<userId>:<phone>`

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub fn features_key(phone_hash: &str) -> String {
    format!("features:{phone_hash}")
}

pub fn ml_result_key(phone_hash: &str) -> String {
    format!("ml_result:{phone_hash}")
}

pub fn whitelist_key(user_id: &str, phone: &str) -> String {
    format!("whitelist:{user_id}:{phone}")
}

/// Key-value cache seam. Implementations may be remote; callers must bound
/// reads with a timeout and treat timeout as a miss.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn invalidate(&self, key: &str);
}

/// Reference in-memory TTL cache. Entries expire lazily on read and are
/// swept opportunistically on write.
#[derive(Debug, Default)]
pub struct InMemoryTtlCache {
    inner: RwLock<HashMap<String, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl InMemoryTtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for InMemoryTtlCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let hit = {
            let map = self.inner.read().expect("cache lock poisoned");
            map.get(key).cloned()
        };
        match hit {
            Some(e) if e.expires_at > now => Some(e.value),
            Some(_) => {
                // Expired: drop it so the map doesn't accumulate dead keys.
                let mut map = self.inner.write().expect("cache lock poisoned");
                if map.get(key).is_some_and(|e| e.expires_at <= now) {
                    map.remove(key);
                }
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let now = Instant::now();
        let mut map = self.inner.write().expect("cache lock poisoned");
        if map.len() > 10_000 {
            map.retain(|_, e| e.expires_at > now);
        }
        map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    async fn invalidate(&self, key: &str) {
        let mut map = self.inner.write().expect("cache lock poisoned");
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache = InMemoryTtlCache::new();
        cache
            .set("features:abc", "{\"x\":1}".into(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("features:abc").await.as_deref(), Some("{\"x\":1}"));
        assert_eq!(cache.get("features:missing").await, None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_miss() {
        let cache = InMemoryTtlCache::new();
        cache
            .set("ml_result:abc", "v".into(), Duration::from_millis(10))
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("ml_result:abc").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = InMemoryTtlCache::new();
        cache
            .set("whitelist:u1:+15550001111", "e".into(), Duration::from_secs(60))
            .await;
        cache.invalidate("whitelist:u1:+15550001111").await;
        assert_eq!(cache.get("whitelist:u1:+15550001111").await, None);
    }

    #[test]
    fn key_scheme_is_stable() {
        assert_eq!(features_key("ab12"), "features:ab12");
        assert_eq!(ml_result_key("ab12"), "ml_result:ab12");
        assert_eq!(whitelist_key("u9", "+15550001111"), "whitelist:u9:+15550001111");
    }
}
