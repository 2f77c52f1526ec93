//! Address cache with TTL expiration
//!
//! Stores resolved addresses per (name, record type) in an LRU cache and
//! expires them based on the TTL of the answer records.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hickory_proto::rr::RecordType;
use lru::LruCache;

/// Default maximum number of cache entries
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Minimum TTL to use for caching (prevents cache churn)
pub const MIN_TTL_SECS: u64 = 30;

/// Maximum TTL to use for caching (prevents stale entries)
pub const MAX_TTL_SECS: u64 = 86400; // 24 hours

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    /// Domain name (lowercased, without trailing dot)
    name: String,
    record_type: RecordType,
}

impl CacheKey {
    fn new(name: &str, record_type: RecordType) -> Self {
        Self {
            name: name.trim_end_matches('.').to_lowercase(),
            record_type,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of expired entries removed
    pub expired: u64,
    /// Current number of entries in cache
    pub entries: usize,
}

/// Resolved address cache with TTL expiration
pub struct AddrCache {
    cache: LruCache<CacheKey, CacheEntry>,
    stats: CacheStats,
}

impl AddrCache {
    /// Create a new cache with the given maximum capacity
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries)
            .or(NonZeroUsize::new(DEFAULT_MAX_ENTRIES))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Get cached addresses, `None` if absent or expired
    pub fn get(&mut self, name: &str, record_type: RecordType) -> Option<Vec<IpAddr>> {
        let key = CacheKey::new(name, record_type);

        match self.cache.get(&key) {
            Some(entry) if Instant::now() >= entry.expires_at => {
                self.cache.pop(&key);
                self.stats.expired += 1;
                self.stats.misses += 1;
                None
            }
            Some(entry) => {
                self.stats.hits += 1;
                Some(entry.addrs.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert addresses with the answer's minimum TTL.
    ///
    /// An empty answer is kept for [`MIN_TTL_SECS`] so that a name without
    /// records of this type is not asked for again on every lookup.
    pub fn insert(&mut self, name: &str, record_type: RecordType, addrs: Vec<IpAddr>, ttl_secs: u32) {
        let ttl_secs = if addrs.is_empty() {
            MIN_TTL_SECS
        } else {
            (ttl_secs as u64).clamp(MIN_TTL_SECS, MAX_TTL_SECS)
        };
        let ttl = Duration::from_secs(ttl_secs);
        self.cache.put(
            CacheKey::new(name, record_type),
            CacheEntry {
                addrs,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.len(),
            ..self.stats.clone()
        }
    }
}
