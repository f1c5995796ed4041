//! Bounded preview cache keyed by `sandboxId:port`.
//!
//! Entries are used only while `now < expires_at`. A full cache evicts the
//! least recently used entry; [`PreviewCache::sweep`] drops expired ones.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewCacheEntry {
    pub url: String,
    pub token: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct Slot {
    entry: PreviewCacheEntry,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    tick: u64,
}

#[derive(Debug)]
pub struct PreviewCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl PreviewCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Entries are plain data, a panic mid-update cannot leave them torn.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A live entry for `key`, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<PreviewCacheEntry> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.slots.get_mut(key) {
            Some(slot) if slot.entry.expires_at > now => {
                slot.last_used = tick;
                Some(slot.entry.clone())
            }
            _ => None,
        }
    }

    /// Store a freshly resolved pair, overwriting whatever was there.
    pub fn insert(&self, key: &str, url: String, token: String) -> PreviewCacheEntry {
        let entry = PreviewCacheEntry {
            url,
            token,
            expires_at: Instant::now() + self.ttl,
        };

        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.slots.contains_key(key) && inner.slots.len() >= self.capacity {
            let now = Instant::now();
            inner.slots.retain(|_, slot| slot.entry.expires_at > now);
            if inner.slots.len() >= self.capacity {
                if let Some(oldest) = inner
                    .slots
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(k, _)| k.clone())
                {
                    inner.slots.remove(&oldest);
                }
            }
        }
        inner.slots.insert(
            key.to_string(),
            Slot {
                entry: entry.clone(),
                last_used: tick,
            },
        );
        entry
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| slot.entry.expires_at > now);
        before - inner.slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = PreviewCache::new(8, Duration::from_secs(60));
        cache.insert("box:3000", "https://u".into(), "t".into());
        assert!(cache.get("box:3000").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("box:3000").is_none());
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_overwrites_stale_entry() {
        let cache = PreviewCache::new(8, Duration::from_secs(60));
        cache.insert("box:3000", "https://old".into(), "t1".into());
        tokio::time::advance(Duration::from_secs(90)).await;
        cache.insert("box:3000", "https://new".into(), "t2".into());

        let entry = cache.get("box:3000").unwrap();
        assert_eq!(entry.url, "https://new");
        assert_eq!(entry.token, "t2");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_least_recently_used_when_full() {
        let cache = PreviewCache::new(2, Duration::from_secs(60));
        cache.insert("a:1", "https://a".into(), "a".into());
        cache.insert("b:1", "https://b".into(), "b".into());
        assert!(cache.get("a:1").is_some());

        cache.insert("c:1", "https://c".into(), "c".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a:1").is_some());
        assert!(cache.get("b:1").is_none());
        assert!(cache.get("c:1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_dropping_expired_entries() {
        let cache = PreviewCache::new(2, Duration::from_secs(60));
        cache.insert("a:1", "https://a".into(), "a".into());
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert("b:1", "https://b".into(), "b".into());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("b:1").is_some());

        cache.insert("c:1", "https://c".into(), "c".into());
        assert!(cache.get("b:1").is_some());
        assert!(cache.get("c:1").is_some());
    }
}
