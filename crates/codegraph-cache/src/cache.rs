use codegraph_core::{CacheConfig, ContentHash, ParseResult};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache key: a file path together with the hash of the content that was parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_path: String,
    pub content_hash: ContentHash,
}

impl CacheKey {
    pub fn new(file_path: &str, content: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            content_hash: ContentHash::of(content),
        }
    }
}

/// Cache entry metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub parse_result: Arc<ParseResult>,
    pub content_hash: ContentHash,
    pub file_path: String,
    pub inserted_at: Instant,
    pub last_access_at: Instant,
    pub hit_count: u64,
}

impl CacheEntry {
    fn new(key: &CacheKey, parse_result: Arc<ParseResult>) -> Self {
        let now = Instant::now();
        Self {
            parse_result,
            content_hash: key.content_hash,
            file_path: key.file_path.clone(),
            inserted_at: now,
            last_access_at: now,
            hit_count: 0,
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }

    fn touch(&mut self) {
        self.last_access_at = Instant::now();
        self.hit_count += 1;
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

/// Content-addressed cache of parse results with LRU eviction and per-entry TTL.
///
/// Not synchronized: the owner (the indexing coordinator) is the only one
/// touching it.
pub struct AstCache {
    entries: LruCache<CacheKey, CacheEntry>,
    // path -> hashes currently cached under it
    by_path: HashMap<String, HashSet<ContentHash>>,
    max_size: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
}

impl AstCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.max_size, config.ttl())
    }

    pub fn with_limits(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::unbounded(),
            by_path: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            invalidations: 0,
        }
    }

    /// Look up the parse result for `content` at `file_path`.
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&mut self, file_path: &str, content: &str) -> Option<Arc<ParseResult>> {
        let key = CacheKey::new(file_path, content);
        self.get_by_key(&key)
    }

    pub fn get_by_key(&mut self, key: &CacheKey) -> Option<Arc<ParseResult>> {
        let expired = match self.entries.peek(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(self.ttl),
        };

        if expired {
            self.remove_key(key);
            self.expirations += 1;
            self.misses += 1;
            debug!(path = %key.file_path, hash = %key.content_hash, "Cache entry expired");
            return None;
        }

        // get_mut promotes the key to most-recently-used
        let entry = self.entries.get_mut(key)?;
        entry.touch();
        self.hits += 1;
        Some(entry.parse_result.clone())
    }

    /// Insert or overwrite the entry for `(file_path, hash(content))`.
    pub fn set(&mut self, file_path: &str, content: &str, parse_result: Arc<ParseResult>) {
        let key = CacheKey::new(file_path, content);
        self.set_by_key(key, parse_result);
    }

    pub fn set_by_key(&mut self, key: CacheKey, parse_result: Arc<ParseResult>) {
        if !self.entries.contains(&key) && self.entries.len() >= self.max_size {
            self.make_room();
        }

        let entry = CacheEntry::new(&key, parse_result);
        self.by_path
            .entry(key.file_path.clone())
            .or_default()
            .insert(key.content_hash);
        self.entries.put(key, entry);
    }

    /// Drop every entry cached under `file_path`, whatever its content hash.
    /// Returns the number of entries removed.
    pub fn invalidate(&mut self, file_path: &str) -> usize {
        let Some(hashes) = self.by_path.remove(file_path) else {
            return 0;
        };
        let mut removed = 0;
        for content_hash in hashes {
            let key = CacheKey {
                file_path: file_path.to_string(),
                content_hash,
            };
            if self.entries.pop(&key).is_some() {
                removed += 1;
            }
        }
        self.invalidations += removed as u64;
        removed
    }

    /// Drop every entry under `file_path` except the one for `keep`.
    pub fn invalidate_stale(&mut self, file_path: &str, keep: ContentHash) -> usize {
        let stale: Vec<ContentHash> = match self.by_path.get(file_path) {
            Some(hashes) => hashes.iter().copied().filter(|h| *h != keep).collect(),
            None => return 0,
        };
        for content_hash in &stale {
            self.remove_key(&CacheKey {
                file_path: file_path.to_string(),
                content_hash: *content_hash,
            });
        }
        self.invalidations += stale.len() as u64;
        stale.len()
    }

    /// Remove all expired entries now instead of waiting for them to be touched.
    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_key(key);
        }
        self.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn contains(&self, file_path: &str, content: &str) -> bool {
        self.entries
            .peek(&CacheKey::new(file_path, content))
            .is_some_and(|entry| !entry.is_expired(self.ttl))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_path.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            evictions: self.evictions,
            expirations: self.expirations,
            invalidations: self.invalidations,
        }
    }

    fn make_room(&mut self) {
        // Expired entries at the LRU end go first, so each one is reclaimed once.
        while let Some((key, entry)) = self.entries.peek_lru() {
            if !entry.is_expired(self.ttl) {
                break;
            }
            let key = key.clone();
            self.remove_key(&key);
            self.expirations += 1;
            debug!(path = %key.file_path, hash = %key.content_hash, "Reclaimed expired cache entry");
        }
        while self.entries.len() >= self.max_size {
            let Some((key, _)) = self.entries.pop_lru() else {
                break;
            };
            self.forget_path_hash(&key);
            self.evictions += 1;
            debug!(path = %key.file_path, hash = %key.content_hash, "Evicted LRU cache entry");
        }
    }

    fn remove_key(&mut self, key: &CacheKey) {
        if self.entries.pop(key).is_some() {
            self.forget_path_hash(key);
        }
    }

    fn forget_path_hash(&mut self, key: &CacheKey) {
        if let Some(hashes) = self.by_path.get_mut(&key.file_path) {
            hashes.remove(&key.content_hash);
            if hashes.is_empty() {
                self.by_path.remove(&key.file_path);
            }
        }
    }
}
