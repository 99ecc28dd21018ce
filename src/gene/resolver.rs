//! Cached gene → transcript resolution
//!
//! Lookups go through two tiers: a bounded in-process LRU with a short TTL,
//! then the shared [`CacheStore`], and only then the failover chain. A hit in
//! the shared store is copied into the in-process tier.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{GeneResolutionClient, GeneValidationResult, TranscriptInfo};
use crate::cache::{CacheKey, CacheStore};
use crate::config::GeneResolutionConfig;
use crate::context::QueryContext;
use crate::error::{EvidenceError, Result};

/// Resolves a gene symbol to its canonical transcript.
#[async_trait]
pub trait GeneTranscriptResolver: Send + Sync {
    async fn resolve_gene_to_transcript(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<TranscriptInfo>;

    async fn get_canonical_transcript_id(&self, ctx: &QueryContext, symbol: &str) -> Result<String> {
        Ok(self.resolve_gene_to_transcript(ctx, symbol).await?.refseq_id)
    }

    /// Every known transcript for `symbol`. Only the canonical one is tracked,
    /// so this is a one-element list.
    async fn get_all_transcripts(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<Vec<TranscriptInfo>> {
        Ok(vec![self.resolve_gene_to_transcript(ctx, symbol).await?])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub total_requests: u64,
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub store_hits: u64,
    pub store_misses: u64,
    pub external_calls: u64,
    pub errors: u64,
    /// Transcripts currently held in memory
    pub memory_entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: AtomicU64,
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    store_hits: AtomicU64,
    store_misses: AtomicU64,
    external_calls: AtomicU64,
    errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct MemoryEntry {
    info: TranscriptInfo,
    expires_at: Instant,
}

/// In-process hot tier. The lock is never held across an await.
struct MemoryTier {
    entries: Mutex<LruCache<String, MemoryEntry>>,
    ttl: Duration,
}

impl MemoryTier {
    fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, symbol: &str) -> Option<TranscriptInfo> {
        let mut entries = self.lock();
        match entries.get(symbol) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.info.clone()),
            Some(_) => {}
            None => return None,
        }
        entries.pop(symbol);
        None
    }

    fn put(&self, symbol: String, info: TranscriptInfo) {
        let entry = MemoryEntry {
            info,
            expires_at: Instant::now() + self.ttl,
        };
        if let Some((evicted, _)) = self.lock().push(symbol.clone(), entry) {
            if evicted != symbol {
                debug!(gene_symbol = %evicted, "evicted transcript from memory");
            }
        }
    }

    fn remove(&self, symbol: &str) {
        self.lock().pop(symbol);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

struct Inner {
    client: GeneResolutionClient,
    cache: CacheStore,
    memory: MemoryTier,
    ttl: Duration,
    max_concurrency: usize,
    counters: Counters,
}

/// Cache-aside resolver in front of a [`GeneResolutionClient`]. Cheap to clone.
#[derive(Clone)]
pub struct CachedTranscriptResolver {
    inner: Arc<Inner>,
}

/// Trim and uppercase a symbol; empty input is rejected.
pub(crate) fn normalize_symbol(symbol: &str) -> Result<String> {
    let normalized = symbol.trim().to_uppercase();
    if normalized.is_empty() {
        return Err(EvidenceError::InvalidInput {
            message: "gene symbol cannot be empty".to_string(),
        });
    }
    Ok(normalized)
}

impl CachedTranscriptResolver {
    pub fn new(client: GeneResolutionClient, cache: CacheStore, config: &GeneResolutionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                cache,
                memory: MemoryTier::new(config.max_memory_size, config.memory_cache_ttl),
                ttl: config.transcript_cache_ttl,
                max_concurrency: config.max_concurrency.max(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn client(&self) -> &GeneResolutionClient {
        &self.inner.client
    }

    /// Resolve many symbols with bounded concurrency. Symbols that fail are
    /// logged and left out of the map; the map is keyed by the symbol as given.
    /// Symbols still waiting for a slot when `ctx` ends are skipped.
    pub async fn batch_resolve(
        &self,
        ctx: &QueryContext,
        symbols: &[String],
    ) -> HashMap<String, TranscriptInfo> {
        let permits = Arc::new(Semaphore::new(self.inner.max_concurrency));
        let mut set = JoinSet::new();
        for symbol in symbols {
            let resolver = self.clone();
            let ctx = ctx.clone();
            let permits = permits.clone();
            let symbol = symbol.clone();
            set.spawn(async move {
                let outcome = match ctx.run(permits.acquire_owned()).await {
                    Ok(Ok(_permit)) => resolver.resolve_gene_to_transcript(&ctx, &symbol).await,
                    Ok(Err(_)) => Err(EvidenceError::Cancelled),
                    Err(e) => Err(e),
                };
                (symbol, outcome)
            });
        }

        let mut resolved = HashMap::with_capacity(symbols.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((symbol, Ok(info))) => {
                    resolved.insert(symbol, info);
                }
                Ok((symbol, Err(e))) => {
                    warn!(gene_symbol = %symbol, error = %e, "batch resolution skipped symbol");
                }
                Err(e) => warn!(error = %e, "batch resolution task failed"),
            }
        }
        debug!(
            requested = symbols.len(),
            resolved = resolved.len(),
            "batch resolution finished"
        );
        resolved
    }

    /// Validate a symbol through the failover chain. Not cached.
    pub async fn validate_gene_symbol(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<GeneValidationResult> {
        let symbol = normalize_symbol(symbol)?;
        self.inner.client.validate_gene_symbol(ctx, &symbol).await
    }

    /// Drop the cached transcript for `symbol` from both tiers.
    pub async fn invalidate(&self, symbol: &str) -> Result<()> {
        let symbol = normalize_symbol(symbol)?;
        self.inner.memory.remove(&symbol);
        self.inner.cache.invalidate(&CacheKey::for_gene(&symbol)).await
    }

    pub fn stats(&self) -> ResolverStats {
        let c = &self.inner.counters;
        ResolverStats {
            total_requests: c.total_requests.load(Ordering::Relaxed),
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            memory_misses: c.memory_misses.load(Ordering::Relaxed),
            store_hits: c.store_hits.load(Ordering::Relaxed),
            store_misses: c.store_misses.load(Ordering::Relaxed),
            external_calls: c.external_calls.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            memory_entries: self.inner.memory.len(),
        }
    }
}

#[async_trait]
impl GeneTranscriptResolver for CachedTranscriptResolver {
    async fn resolve_gene_to_transcript(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<TranscriptInfo> {
        let counters = &self.inner.counters;
        bump(&counters.total_requests);
        let symbol = match normalize_symbol(symbol) {
            Ok(symbol) => symbol,
            Err(e) => {
                bump(&counters.errors);
                return Err(e);
            }
        };

        if let Some(hit) = self.inner.memory.get(&symbol) {
            bump(&counters.memory_hits);
            debug!(gene_symbol = %symbol, transcript = %hit.refseq_id, "transcript memory hit");
            return Ok(hit);
        }
        bump(&counters.memory_misses);

        let key = CacheKey::for_gene(&symbol);
        match self.inner.cache.get::<TranscriptInfo>(&key).await {
            Ok(Some(hit)) => {
                bump(&counters.store_hits);
                debug!(gene_symbol = %symbol, transcript = %hit.refseq_id, "transcript cache hit");
                self.inner.memory.put(symbol, hit.clone());
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!(gene_symbol = %symbol, error = %e, "transcript cache read failed"),
        }
        bump(&counters.store_misses);
        bump(&counters.external_calls);

        let info = match self.inner.client.get_canonical_transcript(ctx, &symbol).await {
            Ok(info) => info,
            Err(e) => {
                bump(&counters.errors);
                return Err(e);
            }
        };

        if let Err(e) = self.inner.cache.set(&key, &info, Some(self.inner.ttl)).await {
            warn!(gene_symbol = %symbol, error = %e, "failed to cache transcript");
        }
        self.inner.memory.put(symbol, info.clone());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gene::{GeneService, TranscriptType};
    use chrono::Utc;

    fn transcript(symbol: &str, refseq_id: &str) -> TranscriptInfo {
        TranscriptInfo {
            refseq_id: refseq_id.to_string(),
            gene_symbol: symbol.to_string(),
            transcript_type: TranscriptType::Canonical,
            length: 7088,
            source: GeneService::Hgnc,
            last_updated: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn memory_tier_evicts_least_recently_used() {
        let tier = MemoryTier::new(2, Duration::from_secs(900));
        tier.put("BRCA1".into(), transcript("BRCA1", "NM_007294.4"));
        tier.put("BRCA2".into(), transcript("BRCA2", "NM_000059.4"));
        // Touch BRCA1 so BRCA2 is the eviction candidate.
        assert!(tier.get("BRCA1").is_some());
        tier.put("TP53".into(), transcript("TP53", "NM_000546.6"));

        assert_eq!(tier.len(), 2);
        assert!(tier.get("BRCA2").is_none());
        assert_eq!(tier.get("BRCA1").unwrap().refseq_id, "NM_007294.4");
        assert_eq!(tier.get("TP53").unwrap().refseq_id, "NM_000546.6");
    }

    #[test]
    fn memory_tier_capacity_is_at_least_one() {
        let tier = MemoryTier::new(0, Duration::from_secs(900));
        tier.put("ATM".into(), transcript("ATM", "NM_000051.4"));
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_tier_entries_expire() {
        let tier = MemoryTier::new(10, Duration::from_secs(900));
        tier.put("BRCA1".into(), transcript("BRCA1", "NM_007294.4"));

        tokio::time::advance(Duration::from_secs(899)).await;
        assert!(tier.get("BRCA1").is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tier.get("BRCA1").is_none());
        assert_eq!(tier.len(), 0, "expired entry is dropped on read");
    }

    #[test]
    fn symbols_are_trimmed_and_uppercased() {
        assert_eq!(normalize_symbol("  brca1 ").unwrap(), "BRCA1");
        assert_eq!(normalize_symbol("Tp53").unwrap(), "TP53");
        assert!(matches!(
            normalize_symbol("   "),
            Err(EvidenceError::InvalidInput { .. })
        ));
    }
}
