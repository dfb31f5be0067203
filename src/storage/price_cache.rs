// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LRU cache for USD token prices.
//!
//! Session creation and claim quoting look up the same handful of symbols
//! repeatedly; caching them for a short TTL keeps the price feed from being
//! hit on every request.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use rust_decimal::Decimal;

/// Cached price + insertion timestamp.
struct CacheEntry {
    usd: Decimal,
    inserted_at: Instant,
}

/// In-process LRU cache keyed by upper-cased token symbol.
pub struct PriceCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl PriceCache {
    /// Create a new cache with the given capacity and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    /// Cached USD price for `symbol`, `None` if absent or expired.
    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        let key = symbol.to_uppercase();
        let mut cache = self.cache.lock().ok()?;
        if let Some(entry) = cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.usd);
            }
            cache.pop(&key);
        }
        None
    }

    pub fn put(&self, symbol: &str, usd: Decimal) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                symbol.to_uppercase(),
                CacheEntry {
                    usd,
                    inserted_at: Instant::now(),
                },
            );
        }
    }
}
