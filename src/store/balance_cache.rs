// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LRU cache for hot balance lookups.
//!
//! Caches the projected balance per (user, chain) to avoid repeated redb
//! reads for the most common query pattern. Invalidated by the poster on
//! every posting that touches the user.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::models::SignedAmount;

/// Cached entry: balance + insertion timestamp.
struct CacheEntry {
    balance: SignedAmount,
    inserted_at: Instant,
}

/// In-process LRU cache for hot balance lookups.
pub struct BalanceCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl BalanceCache {
    /// Create a new cache with the given capacity and TTL.
    ///
    /// - `capacity`: Max number of (user, chain) pairs to cache.
    /// - `ttl`: Time-to-live for each cache entry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
            )),
            ttl,
        }
    }

    fn key(user_id: &str, chain: &str) -> String {
        format!("{user_id}|{chain}")
    }

    /// Get the cached balance. Returns `None` if not cached or expired.
    pub fn get(&self, user_id: &str, chain: &str) -> Option<SignedAmount> {
        let key = Self::key(user_id, chain);
        let mut cache = self.cache.lock().ok()?;
        if let Some(entry) = cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.balance);
            }
            // Expired — remove it
            cache.pop(&key);
        }
        None
    }

    /// Store a balance.
    pub fn put(&self, user_id: &str, chain: &str, balance: SignedAmount) {
        let key = Self::key(user_id, chain);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                key,
                CacheEntry {
                    balance,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Invalidate the cache for one (user, chain).
    pub fn invalidate(&self, user_id: &str, chain: &str) {
        let key = Self::key(user_id, chain);
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_put_and_get() {
        let cache = BalanceCache::new(10, Duration::from_secs(300));
        assert!(cache.get("user-1", "fuji").is_none());

        cache.put("user-1", "fuji", 100);
        assert_eq!(cache.get("user-1", "fuji"), Some(100));
        assert!(cache.get("user-1", "avax").is_none());
    }

    #[test]
    fn cache_invalidate() {
        let cache = BalanceCache::new(10, Duration::from_secs(300));
        cache.put("user-1", "fuji", 100);
        cache.invalidate("user-1", "fuji");
        assert!(cache.get("user-1", "fuji").is_none());
    }

    #[test]
    fn cache_ttl_expiry() {
        let cache = BalanceCache::new(10, Duration::from_millis(1));
        cache.put("user-1", "fuji", 100);

        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("user-1", "fuji").is_none());
    }
}
