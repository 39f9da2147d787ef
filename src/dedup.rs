use crate::config::ConfigError;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-capacity membership set over frame fingerprints.
///
/// A frame is keyed by the SHA-256 of its full byte content, which keeps the
/// store robust against framings we do not parse. Entries are evicted
/// least-recently-used once the store is full, and a hit older than the TTL
/// is treated as a miss (the stale entry is refreshed in place).
pub struct DedupStore {
    seen: Mutex<LruCache<[u8; 32], Instant>>,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(ConfigError::InvalidDedupCapacity)?;
        Ok(Self {
            seen: Mutex::new(LruCache::new(capacity)),
            ttl,
        })
    }

    /// Returns true iff the frame was already present (and fresh) at the time
    /// of the call. Otherwise records the frame and returns false. The whole
    /// check-then-insert runs under one lock, so concurrent callers observe a
    /// total order and exactly one of them wins a given new fingerprint.
    pub fn test_and_insert(&self, frame: &[u8]) -> bool {
        self.test_and_insert_at(frame, Instant::now())
    }

    pub fn test_and_insert_at(&self, frame: &[u8], now: Instant) -> bool {
        let key: [u8; 32] = Sha256::digest(frame).into();
        let mut seen = self.seen.lock().unwrap();
        // get() promotes the entry, so a hit also counts as a "use" for LRU.
        match seen.get(&key) {
            Some(at) if now.saturating_duration_since(*at) < self.ttl => true,
            _ => {
                seen.put(key, now);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_first_seen_then_duplicate() {
        let store = DedupStore::new(10, TTL).unwrap();

        assert!(!store.test_and_insert(b"packet content 1"));
        assert!(store.test_and_insert(b"packet content 1"));
        assert!(!store.test_and_insert(b"packet content 2"));
        assert!(store.test_and_insert(b"packet content 2"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_lru_eviction_respects_touch() {
        let store = DedupStore::new(2, TTL).unwrap();

        assert!(!store.test_and_insert(b"p1"));
        assert!(!store.test_and_insert(b"p2"));
        // Touch p2 so p1 becomes the eviction candidate.
        assert!(store.test_and_insert(b"p2"));
        // p3 pushes p1 out.
        assert!(!store.test_and_insert(b"p3"));
        assert!(!store.test_and_insert(b"p1"));
        assert!(store.test_and_insert(b"p3"));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let store = DedupStore::new(10, TTL).unwrap();
        let t0 = Instant::now();

        assert!(!store.test_and_insert_at(b"stale", t0));
        // Within the TTL it is still a duplicate.
        assert!(store.test_and_insert_at(b"stale", t0 + Duration::from_secs(29)));
        // Past the TTL the entry no longer causes a hit and is re-recorded.
        assert!(!store.test_and_insert_at(b"stale", t0 + Duration::from_secs(31)));
        // The refresh restarts the clock.
        assert!(store.test_and_insert_at(b"stale", t0 + Duration::from_secs(32)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(DedupStore::new(0, TTL).is_err());
    }
}
