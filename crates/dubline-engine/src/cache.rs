//! Bounded, TTL-based store of hydrated windows.
//!
//! Keys are `(media id, language, floor(t))`.  Expiry is checked lazily on
//! access; the size bound is enforced on insert by dropping the
//! oldest-inserted entry regardless of age.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dubline_proto::protocol::Line;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub media_id: String,
    pub language: String,
    pub bucket: i64,
}

impl CacheKey {
    pub fn new(media_id: &str, language: &str, t: f64) -> Self {
        Self::for_bucket(media_id, language, bucket_of(t))
    }

    pub fn for_bucket(media_id: &str, language: &str, bucket: i64) -> Self {
        Self {
            media_id: media_id.to_string(),
            language: language.to_string(),
            bucket,
        }
    }
}

/// 1-second quantisation of playback time.
pub fn bucket_of(t: f64) -> i64 {
    t.floor() as i64
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub inserted_at: Instant,
    pub lines: Arc<[Line]>,
}

#[derive(Debug)]
pub struct WindowCache {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Insertion order, oldest first.  Always holds exactly the live keys.
    order: VecDeque<CacheKey>,
    ttl: Duration,
    capacity: usize,
}

impl WindowCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, media_id: &str, language: &str, t: f64) -> Option<Arc<[Line]>> {
        self.get_bucket(media_id, language, bucket_of(t))
    }

    pub fn get_bucket(
        &mut self,
        media_id: &str,
        language: &str,
        bucket: i64,
    ) -> Option<Arc<[Line]>> {
        let key = CacheKey::for_bucket(media_id, language, bucket);
        let inserted_at = self.entries.get(&key)?.inserted_at;

        if Instant::now().saturating_duration_since(inserted_at) > self.ttl {
            debug!("cache: expired {:?}", key);
            self.remove(&key);
            return None;
        }

        self.entries.get(&key).map(|e| Arc::clone(&e.lines))
    }

    /// Like [`WindowCache::get`] but leaves expired entries in place.
    pub fn contains(&self, media_id: &str, language: &str, t: f64) -> bool {
        let key = CacheKey::new(media_id, language, t);
        self.entries
            .get(&key)
            .is_some_and(|e| Instant::now().saturating_duration_since(e.inserted_at) <= self.ttl)
    }

    pub fn put(&mut self, media_id: &str, language: &str, t: f64, lines: Arc<[Line]>) {
        self.put_bucket(media_id, language, bucket_of(t), lines);
    }

    /// Overwriting a key counts as a fresh insertion for both TTL and
    /// eviction order.
    pub fn put_bucket(&mut self, media_id: &str, language: &str, bucket: i64, lines: Arc<[Line]>) {
        let key = CacheKey::for_bucket(media_id, language, bucket);
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }

        self.order.push_back(key.clone());
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                inserted_at: Instant::now(),
                lines,
            },
        );

        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    debug!("cache: evicting {:?}", oldest);
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drop every entry for `media_id`.  Returns how many were removed.
    pub fn purge(&mut self, media_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.media_id != media_id);
        self.order.retain(|k| k.media_id != media_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("cache: purged {} entries for {}", removed, media_id);
        }
        removed
    }

    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Arc<[Line]> {
        vec![Line::new(0.0, 1.0, text)].into()
    }

    fn text(cache: &mut WindowCache, media: &str, lang: &str, t: f64) -> Option<String> {
        cache.get(media, lang, t).map(|l| l[0].text.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucketed_lookup() {
        let mut cache = WindowCache::new(Duration::from_secs(120), 10);
        cache.put("vid1", "fr", 11.2, lines("a"));

        assert_eq!(text(&mut cache, "vid1", "fr", 11.9).as_deref(), Some("a"));
        assert_eq!(text(&mut cache, "vid1", "fr", 11.0).as_deref(), Some("a"));
        assert!(cache.contains("vid1", "fr", 11.5));
        assert!(cache.get("vid1", "fr", 12.0).is_none());
        assert!(cache.get("vid1", "de", 11.5).is_none());
        assert!(cache.get("vid2", "fr", 11.5).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted_on_access() {
        let mut cache = WindowCache::new(Duration::from_secs(120), 10);
        cache.put("vid1", "fr", 5.0, lines("a"));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cache.get("vid1", "fr", 5.0).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.contains("vid1", "fr", 5.0));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("vid1", "fr", 5.0).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_inserted() {
        let mut cache = WindowCache::new(Duration::from_secs(120), 3);
        cache.put("vid1", "fr", 1.0, lines("1"));
        cache.put("vid1", "fr", 2.0, lines("2"));
        cache.put("vid1", "fr", 3.0, lines("3"));
        // Reading does not refresh insertion order.
        assert!(cache.get("vid1", "fr", 1.0).is_some());

        cache.put("vid1", "fr", 4.0, lines("4"));
        assert_eq!(cache.len(), 3);
        assert!(cache.get("vid1", "fr", 1.0).is_none());
        assert!(cache.get("vid1", "fr", 2.0).is_some());
        assert!(cache.get("vid1", "fr", 4.0).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_moves_to_back() {
        let mut cache = WindowCache::new(Duration::from_secs(120), 2);
        cache.put("vid1", "fr", 1.0, lines("old"));
        cache.put("vid1", "fr", 2.0, lines("2"));
        cache.put("vid1", "fr", 1.0, lines("new"));
        cache.put("vid1", "fr", 3.0, lines("3"));

        assert_eq!(cache.len(), 2);
        assert_eq!(text(&mut cache, "vid1", "fr", 1.0).as_deref(), Some("new"));
        assert!(cache.get("vid1", "fr", 2.0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_only_that_media() {
        let mut cache = WindowCache::new(Duration::from_secs(120), 10);
        cache.put("vid1", "fr", 1.0, lines("a"));
        cache.put("vid1", "de", 2.0, lines("b"));
        cache.put("vid2", "fr", 1.0, lines("c"));

        assert_eq!(cache.purge("vid1"), 2);
        assert!(cache.get("vid1", "fr", 1.0).is_none());
        assert!(cache.get("vid1", "de", 2.0).is_none());
        assert_eq!(text(&mut cache, "vid2", "fr", 1.0).as_deref(), Some("c"));
        assert_eq!(cache.purge("vid1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purged_keys_do_not_count_against_bound() {
        let mut cache = WindowCache::new(Duration::from_secs(120), 2);
        cache.put("vid1", "fr", 1.0, lines("a"));
        cache.put("vid1", "fr", 2.0, lines("b"));
        cache.purge("vid1");
        cache.put("vid2", "fr", 1.0, lines("c"));
        cache.put("vid2", "fr", 2.0, lines("d"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("vid2", "fr", 1.0).is_some());
    }

    #[test]
    fn test_bucket_floors_negative_time() {
        assert_eq!(bucket_of(-0.5), -1);
        assert_eq!(bucket_of(0.0), 0);
        assert_eq!(bucket_of(17.999), 17);
    }
}
