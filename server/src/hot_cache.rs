//! The in-memory hot cache.
//!
//! First cache tier: a byte-size-bounded LRU in front of the disk
//! store. Two value shapes coexist, raw plaintext chunks and parsed
//! stream descriptors. Values are immutable once inserted, so handing
//! out clones to concurrent readers is safe even when the entry is
//! evicted underneath them.
//!
//! All lookups go through a per-key single-flight group, so N
//! concurrent readers of a cold chunk produce exactly one origin
//! fetch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::single_flight::SingleFlight;
use crate::store::{DecryptedStore, DecryptionData, StoreError};
use strand::blob::BlobHash;
use strand::descriptor::{SdBlob, KEY_SIZE};

/// A cached value.
#[derive(Clone)]
pub enum CacheValue {
    /// A decrypted chunk.
    Chunk(Bytes),

    /// A parsed stream descriptor.
    Descriptor(Arc<SdBlob>),
}

impl CacheValue {
    /// Size charged against the cache quota. An upper bound.
    fn size(&self) -> usize {
        match self {
            Self::Chunk(bytes) => bytes.len(),
            Self::Descriptor(sd) => sd.estimated_size(),
        }
    }
}

struct SizedLru {
    entries: LruCache<String, CacheValue>,
    total_bytes: usize,
    max_bytes: usize,
}

impl SizedLru {
    fn get(&mut self, hash: &str) -> Option<CacheValue> {
        self.entries.get(hash).cloned()
    }

    fn contains(&self, hash: &str) -> bool {
        self.entries.contains(hash)
    }

    /// Inserts a value and evicts LRU entries until the quota holds
    /// again. Returns the number of evictions.
    fn insert(&mut self, hash: String, value: CacheValue) -> u64 {
        if let Some(old) = self.entries.put(hash, value.clone()) {
            self.total_bytes -= old.size();
        }
        self.total_bytes += value.size();

        let mut evicted = 0;
        while self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, old)) => {
                    self.total_bytes -= old.size();
                    evicted += 1;
                }
                None => break,
            }
        }

        evicted
    }
}

/// Counters exposed for observability.
#[derive(Debug, Default)]
pub struct HotCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

/// The in-memory hot cache over the disk store.
///
/// Shared by all concurrent streams in the process; all methods are
/// safe to call from any number of tasks.
pub struct HotCache {
    store: Arc<DecryptedStore>,
    cache: Arc<Mutex<SizedLru>>,
    flight: SingleFlight<Result<CacheValue, StoreError>>,
    stats: Arc<HotCacheStats>,
}

impl HotCache {
    pub fn new(store: Arc<DecryptedStore>, max_bytes: usize) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(SizedLru {
                // The LRU itself is unbounded; eviction is driven
                // purely by byte accounting.
                entries: LruCache::unbounded(),
                total_bytes: 0,
                max_bytes: max_bytes.max(1),
            })),
            flight: SingleFlight::new(),
            stats: Arc::new(HotCacheStats::default()),
        }
    }

    /// Gets a parsed stream descriptor, fetching and caching it on
    /// miss.
    pub async fn get_sd_blob(&self, hash: &BlobHash) -> Result<Arc<SdBlob>, StoreError> {
        match self.fetch(hash, None).await? {
            CacheValue::Descriptor(sd) => Ok(sd),
            CacheValue::Chunk(_) => Err(StoreError::Descriptor(format!(
                "{hash} is cached as a chunk, not a descriptor"
            ))),
        }
    }

    /// Gets a decrypted chunk, fetching and caching it on miss.
    pub async fn get_chunk(
        &self,
        hash: &BlobHash,
        key: &[u8; KEY_SIZE],
        iv: &[u8; KEY_SIZE],
    ) -> Result<Bytes, StoreError> {
        let extra = DecryptionData { key: *key, iv: *iv };

        match self.fetch(hash, Some(extra)).await? {
            CacheValue::Chunk(bytes) => Ok(bytes),
            CacheValue::Descriptor(_) => Err(StoreError::Descriptor(format!(
                "{hash} is cached as a descriptor, not a chunk"
            ))),
        }
    }

    /// Returns whether a hash is in memory right now.
    pub fn is_cached(&self, hash: &BlobHash) -> bool {
        self.cache.lock().contains(hash.as_str())
    }

    pub fn stats(&self) -> &HotCacheStats {
        &self.stats
    }

    /// Lookup with single-flight fill. `extra` decides the value
    /// shape: chunk when key material is present, descriptor when not.
    async fn fetch(
        &self,
        hash: &BlobHash,
        extra: Option<DecryptionData>,
    ) -> Result<CacheValue, StoreError> {
        if let Some(value) = self.cache.lock().get(hash.as_str()) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let store = self.store.clone();
        let cache = self.cache.clone();
        let stats = self.stats.clone();
        let key = hash.as_str().to_owned();
        let hash = hash.clone();

        self.flight
            .run(&key, move || async move {
                // A previous flight may have filled the cache while we
                // were queueing on the registry lock.
                if let Some(value) = cache.lock().get(hash.as_str()) {
                    return Ok(value);
                }

                let parse_descriptor = extra.is_none();
                let bytes = store.get(&hash, extra.as_ref()).await?;

                let value = if parse_descriptor {
                    let sd = SdBlob::from_bytes(&bytes)
                        .map_err(|e| StoreError::Descriptor(e.to_string()))?;
                    CacheValue::Descriptor(Arc::new(sd))
                } else {
                    CacheValue::Chunk(bytes)
                };

                let evicted = cache.lock().insert(hash.as_str().to_owned(), value.clone());
                if evicted > 0 {
                    tracing::debug!(evicted, "hot cache evicted entries");
                    stats.evictions.fetch_add(evicted, Ordering::Relaxed);
                }

                Ok(value)
            })
            .await
    }
}
