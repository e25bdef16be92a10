// src/wallet/cache.rs
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Short-TTL balance cache in front of the single-column repository read.
/// Single writer (the manager), many readers; entries expire by TTL and a
/// high-watermark prune keeps the map bounded.
pub struct BalanceCache {
    entries: HashMap<Uuid, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: u64,
    misses: u64,
}

struct CacheEntry {
    balance: f64,
    inserted_at: Instant,
}

impl BalanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: 10_000,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, wallet_id: Uuid) -> Option<f64> {
        match self.entries.get(&wallet_id) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits += 1;
                Some(entry.balance)
            }
            Some(_) => {
                self.entries.remove(&wallet_id);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, wallet_id: Uuid, balance: f64) {
        if self.entries.len() >= self.max_entries {
            self.prune_oldest(self.max_entries / 10);
        }
        self.entries.insert(
            wallet_id,
            CacheEntry {
                balance,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, wallet_id: Uuid) {
        self.entries.remove(&wallet_id);
    }

    pub fn clear_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn prune_oldest(&mut self, count: usize) {
        let mut by_age: Vec<(Uuid, Instant)> = self
            .entries
            .iter()
            .map(|(id, e)| (*id, e.inserted_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (id, _) in by_age.into_iter().take(count) {
            self.entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_and_invalidate() {
        let mut cache = BalanceCache::new(Duration::from_secs(30));
        let id = Uuid::new_v4();

        assert!(cache.get(id).is_none());
        cache.insert(id, 1.5);
        assert_eq!(cache.get(id), Some(1.5));

        cache.invalidate(id);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = BalanceCache::new(Duration::from_millis(0));
        let id = Uuid::new_v4();
        cache.insert(id, 2.0);
        // zero TTL: entry is already stale
        assert!(cache.get(id).is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_high_watermark_prune() {
        let mut cache = BalanceCache::new(Duration::from_secs(60));
        cache.max_entries = 10;
        for _ in 0..10 {
            cache.insert(Uuid::new_v4(), 1.0);
        }
        // hitting the watermark evicts a tenth of the map before inserting
        cache.insert(Uuid::new_v4(), 1.0);
        assert!(cache.size() <= 10);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let mut cache = BalanceCache::new(Duration::from_secs(30));
        let id = Uuid::new_v4();
        cache.get(id);
        cache.insert(id, 1.0);
        cache.get(id);
        let (hits, misses) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }
}
