use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::metadata::MetadataRecord;

struct CacheEntry {
    record: Arc<MetadataRecord>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub keys: usize,
}

/// Metadata records keyed by video identifier. Entries stop being visible
/// once their ttl has elapsed, whether or not `purge_expired` has run yet.
#[derive(Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, video_id: &str) -> Option<Arc<MetadataRecord>> {
        let now = Instant::now();
        let found = self
            .entries
            .read()
            .get(video_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| Arc::clone(&entry.record));

        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);

        found
    }

    pub fn put(&self, video_id: impl Into<String>, record: MetadataRecord, ttl: Duration) {
        let entry = CacheEntry {
            record: Arc::new(record),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(video_id.into(), entry);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let keys = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count();

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_record;

    const TTL: Duration = Duration::from_secs(60 * 60);

    #[tokio::test(start_paused = true)]
    async fn put_then_get_within_ttl_returns_identical_record() {
        let cache = MetadataCache::new();
        let record = sample_record("First");

        cache.put("abc123", record.clone(), TTL);
        tokio::time::advance(TTL - Duration::from_secs(1)).await;

        let cached = cache.get("abc123").expect("entry within ttl");
        assert_eq!(*cached, record);
    }

    #[tokio::test(start_paused = true)]
    async fn get_after_ttl_is_a_miss_even_before_purge() {
        let cache = MetadataCache::new();
        cache.put("abc123", sample_record("First"), TTL);

        tokio::time::advance(TTL).await;

        assert!(cache.get("abc123").is_none());
        assert_eq!(cache.stats().keys, 0);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn put_replaces_previous_entry_and_restarts_ttl() {
        let cache = MetadataCache::new();
        cache.put("abc123", sample_record("First"), TTL);
        tokio::time::advance(TTL / 2).await;

        cache.put("abc123", sample_record("Second"), TTL);
        tokio::time::advance(TTL / 2 + Duration::from_secs(1)).await;

        let cached = cache.get("abc123").expect("replacement still live");
        assert_eq!(cached.title, "Second");
    }

    #[tokio::test]
    async fn stats_count_hits_misses_and_live_keys() {
        let cache = MetadataCache::new();
        cache.put("a", sample_record("A"), TTL);
        cache.put("b", sample_record("B"), TTL);

        assert!(cache.get("a").is_some());
        assert!(cache.get("a").is_some());
        assert!(cache.get("missing").is_none());

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                keys: 2,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_expose_torn_entries() {
        let cache = Arc::new(MetadataCache::new());
        let mut tasks = Vec::new();

        for worker in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for round in 0..200 {
                    let title = format!("worker-{worker}-round-{round}");
                    let mut record = sample_record(&title);
                    record.author = title.clone();
                    cache.put("shared", record, TTL);

                    if let Some(seen) = cache.get("shared") {
                        assert_eq!(seen.title, seen.author);
                    }
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        let last = cache.get("shared").unwrap();
        assert_eq!(last.title, last.author);
    }
}
