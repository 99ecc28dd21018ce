//! # Evidence Cache
//!
//! Cache-aside storage shared by every external source. Payloads are wrapped in a
//! [`CacheEntry`] envelope carrying `cached_at` and `expires_at`, serialized as
//! JSON and handed to a [`CacheBackend`].
//!
//! The [`CacheStore`] owns the read policy:
//!
//! - a missing key is a miss
//! - an envelope that no longer decodes is a miss, and the entry is deleted
//! - an envelope observed at or after `expires_at` is a miss, and the entry is deleted
//!
//! Expiry is judged against the store's [`Clock`], so tests can move time with a
//! [`ManualClock`] instead of sleeping.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use variant_evidence::cache::{CacheKey, CacheStore, MemoryCacheBackend};
//!
//! # #[tokio::main]
//! # async fn main() -> variant_evidence::Result<()> {
//! let store = CacheStore::new(Arc::new(MemoryCacheBackend::new()), Duration::from_secs(60));
//! let key = CacheKey::for_gene("BRCA1");
//! store.set(&key, &"NM_007294.4".to_string(), None).await?;
//! let hit: Option<String> = store.get(&key).await?;
//! assert_eq!(hit.as_deref(), Some("NM_007294.4"));
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryCacheBackend;
pub use sqlite::SqliteCacheBackend;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EvidenceError, Result};
use crate::evidence::EvidenceKind;
use crate::variant::Variant;

/// Bytes of the variant identity hash used in cache keys.
const KEY_HASH_BYTES: usize = 16;

/// Raw key/value storage with backend-level expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, overwriting any previous one. A zero `ttl` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    /// Number of live entries.
    async fn len(&self) -> Result<usize>;
}

/// Source of wall-clock time for expiry checks.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(by) = chrono::Duration::from_std(by) {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Key of one cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `<prefix>:variant:<hash>`, derived only from the variant identity fields.
    pub fn for_variant(kind: EvidenceKind, variant: &Variant) -> Self {
        Self(format!(
            "{}:variant:{}",
            kind.cache_prefix(),
            variant.key().short_hex(KEY_HASH_BYTES)
        ))
    }

    /// `transcript:gene:<SYMBOL>`; the symbol is expected to be normalised already.
    pub fn for_gene(symbol: &str) -> Self {
        Self(format!("transcript:gene:{}", symbol))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored envelope around a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Counters reported by [`CacheStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub corrupt: u64,
    pub writes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    corrupt: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Typed cache over a [`CacheBackend`]. Cheap to clone; clones share the backend and stats.
#[derive(Debug, Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    counters: Arc<Counters>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            default_ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read a payload. Corrupt and expired entries are misses and get deleted.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let raw = match self.backend.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                bump(&self.counters.misses);
                return Ok(None);
            }
            Err(e) => {
                bump(&self.counters.errors);
                return Err(e);
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "discarding corrupt cache entry");
                bump(&self.counters.corrupt);
                bump(&self.counters.misses);
                self.discard(key).await;
                return Ok(None);
            }
        };

        if entry.is_expired(self.clock.now()) {
            debug!(key = %key, expires_at = %entry.expires_at, "cache entry expired");
            bump(&self.counters.expired);
            bump(&self.counters.misses);
            self.discard(key).await;
            return Ok(None);
        }

        bump(&self.counters.hits);
        Ok(Some(entry.data))
    }

    /// Write a payload, replacing any previous value. `None` or a zero TTL uses the default.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        payload: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.default_ttl);
        let cached_at = self.clock.now();
        let lifetime = chrono::Duration::from_std(ttl)
            .map_err(|e| EvidenceError::Cache(format!("ttl {:?} out of range: {}", ttl, e)))?;
        let entry = CacheEntry {
            data: payload,
            cached_at,
            expires_at: cached_at + lifetime,
        };
        let raw = serde_json::to_string(&entry)?;
        match self.backend.set(key.as_str(), &raw, ttl).await {
            Ok(()) => {
                bump(&self.counters.writes);
                Ok(())
            }
            Err(e) => {
                bump(&self.counters.errors);
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.backend.delete(&[key.as_str().to_string()]).await?;
        Ok(())
    }

    /// Remove the cached payload of every evidence kind for `variant`.
    pub async fn invalidate_variant(&self, variant: &Variant) -> Result<u64> {
        let keys: Vec<String> = EvidenceKind::ALL
            .iter()
            .map(|kind| CacheKey::for_variant(*kind, variant).0)
            .collect();
        self.backend.delete(&keys).await
    }

    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        self.backend.delete_prefix(prefix).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            corrupt: c.corrupt.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    async fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.invalidate(key).await {
            warn!(key = %key, error = %e, "failed to delete stale cache entry");
        }
    }
}
