//! # Integration Tests for Evidence Gathering
//!
//! Drives the full stack (cache, breakers, resilient clients, fan-out) with
//! scripted sources whose behaviour and call counts the tests control.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use variant_evidence::cache::{CacheBackend, CacheKey, CacheStore, MemoryCacheBackend};
use variant_evidence::evidence::{
    ClinVarData, HgmdData, LiteratureData, LovdData, PopulationData, SomaticData,
};
use variant_evidence::resilience::{BreakerSettings, CircuitBreaker, CircuitState, TripCondition};
use variant_evidence::{
    Evidence, EvidenceAggregator, EvidenceError, EvidenceKind, EvidenceSources,
    ExternalSourceClient, QueryContext, ResilientServiceClient, Result, Variant,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    Succeed,
    Fail,
    Stall,
    Panic,
}

struct Scripted<D> {
    behavior: Behavior,
    failing: AtomicBool,
    calls: AtomicUsize,
    payload: D,
}

impl<D: Evidence + Default> Scripted<D> {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            failing: AtomicBool::new(behavior == Behavior::Fail),
            calls: AtomicUsize::new(0),
            payload: D::default(),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<D: Evidence + Default> ExternalSourceClient for Scripted<D> {
    type Data = D;

    async fn query(&self, _ctx: &QueryContext, _variant: &Variant) -> Result<D> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Stall => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Behavior::Panic => panic!("adapter bug"),
            _ => {}
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EvidenceError::transient(D::KIND.service_name(), "HTTP 503"));
        }
        Ok(self.payload.clone())
    }
}

struct Harness {
    clinvar: Arc<Scripted<ClinVarData>>,
    gnomad: Arc<Scripted<PopulationData>>,
    cosmic: Arc<Scripted<SomaticData>>,
    pubmed: Arc<Scripted<LiteratureData>>,
    lovd: Arc<Scripted<LovdData>>,
    hgmd: Arc<Scripted<HgmdData>>,
    cache: CacheStore,
    aggregator: EvidenceAggregator,
}

impl Harness {
    /// Behaviours in `EvidenceKind::ALL` order.
    fn new(behaviors: [Behavior; 6]) -> Self {
        let cache = CacheStore::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(3600),
        );
        let clinvar = Scripted::new(behaviors[0]);
        let gnomad = Scripted::new(behaviors[1]);
        let cosmic = Scripted::new(behaviors[2]);
        let pubmed = Scripted::new(behaviors[3]);
        let lovd = Scripted::new(behaviors[4]);
        let hgmd = Scripted::new(behaviors[5]);

        let sources = EvidenceSources {
            clinvar: resilient(clinvar.clone(), &cache),
            gnomad: resilient(gnomad.clone(), &cache),
            cosmic: resilient(cosmic.clone(), &cache),
            pubmed: resilient(pubmed.clone(), &cache),
            lovd: resilient(lovd.clone(), &cache),
            hgmd: resilient(hgmd.clone(), &cache),
        };
        let aggregator = EvidenceAggregator::new(sources, cache.clone());
        Self {
            clinvar,
            gnomad,
            cosmic,
            pubmed,
            lovd,
            hgmd,
            cache,
            aggregator,
        }
    }

    fn total_calls(&self) -> usize {
        self.clinvar.calls()
            + self.gnomad.calls()
            + self.cosmic.calls()
            + self.pubmed.calls()
            + self.lovd.calls()
            + self.hgmd.calls()
    }
}

fn resilient<D: Evidence + Default>(
    source: Arc<Scripted<D>>,
    cache: &CacheStore,
) -> ResilientServiceClient<D> {
    let breaker = Arc::new(CircuitBreaker::new(
        D::KIND.service_name(),
        BreakerSettings::public_source(),
    ));
    ResilientServiceClient::new(source, breaker, cache.clone(), D::KIND.default_ttl())
}

fn brca1_variant() -> Variant {
    Variant::new("17", 43104121, "G", "A")
}

use Behavior::{Fail, Panic, Stall, Succeed};

#[tokio::test]
async fn test_partial_failure_keeps_successful_kinds() {
    init_tracing();
    let harness = Harness::new([Fail, Fail, Fail, Succeed, Succeed, Fail]);
    let bundle = harness
        .aggregator
        .gather_evidence(&QueryContext::background(), &brca1_variant())
        .await
        .expect("partial gather is a success");

    assert_eq!(
        bundle.populated_kinds(),
        vec![EvidenceKind::Literature, EvidenceKind::GeneSpecificDatabase]
    );
    assert!(bundle.clinical_significance.is_none());
    assert!(bundle.mutation_database.is_none());
}

#[tokio::test]
async fn test_total_failure_names_every_source() {
    init_tracing();
    let harness = Harness::new([Fail; 6]);
    let err = harness
        .aggregator
        .gather_evidence(&QueryContext::background(), &brca1_variant())
        .await
        .unwrap_err();

    let message = err.to_string();
    match err {
        EvidenceError::AggregateFailure { failures } => {
            let kinds: Vec<_> = failures.iter().map(|f| f.kind).collect();
            assert_eq!(kinds, EvidenceKind::ALL);
            for kind in EvidenceKind::ALL {
                assert!(message.contains(kind.service_name()), "{message}");
            }
        }
        other => panic!("expected AggregateFailure, got {other}"),
    }
}

#[tokio::test]
async fn test_second_gather_is_served_from_cache() {
    init_tracing();
    let harness = Harness::new([Succeed; 6]);
    let ctx = QueryContext::background();
    let variant = brca1_variant();

    let first = harness
        .aggregator
        .gather_evidence(&ctx, &variant)
        .await
        .unwrap();
    assert_eq!(first.populated_kinds().len(), 6);
    assert_eq!(harness.total_calls(), 6);
    assert_eq!(harness.clinvar.calls(), 1);
    assert_eq!(harness.cache.len().await.unwrap(), 6);

    let second = harness
        .aggregator
        .gather_evidence(&ctx, &variant)
        .await
        .unwrap();
    assert_eq!(second.populated_kinds().len(), 6);
    assert_eq!(harness.total_calls(), 6, "second gather must not hit the network");
    assert_ne!(first.gather_id, second.gather_id);
    assert_eq!(harness.aggregator.stats().cache.hits, 6);
}

#[tokio::test(start_paused = true)]
async fn test_gather_deadline_is_authoritative() {
    init_tracing();
    let harness = Harness::new([Succeed, Succeed, Stall, Succeed, Succeed, Succeed]);
    let aggregator = harness
        .aggregator
        .clone()
        .with_gather_timeout(Duration::from_secs(5));

    let err = aggregator
        .gather_evidence(&QueryContext::background(), &brca1_variant())
        .await
        .unwrap_err();
    assert!(matches!(err, EvidenceError::DeadlineExceeded));
    assert_eq!(harness.cosmic.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_gather() {
    let harness = Harness::new([Stall; 6]);
    let (ctx, handle) = QueryContext::cancellable();
    let gather = {
        let aggregator = harness.aggregator.clone();
        tokio::spawn(async move { aggregator.gather_evidence(&ctx, &brca1_variant()).await })
    };
    tokio::task::yield_now().await;
    handle.cancel();
    let err = gather.await.unwrap().unwrap_err();
    assert!(matches!(err, EvidenceError::Cancelled));
}

#[tokio::test]
async fn test_panicking_source_counts_as_failure() {
    let harness = Harness::new([Succeed, Panic, Succeed, Succeed, Succeed, Succeed]);
    let bundle = harness
        .aggregator
        .gather_evidence(&QueryContext::background(), &brca1_variant())
        .await
        .unwrap();
    assert!(!bundle.has(EvidenceKind::PopulationFrequency));
    assert_eq!(bundle.populated_kinds().len(), 5);
}

#[tokio::test]
async fn test_repeated_failures_open_the_breaker() {
    let harness = Harness::new([Succeed, Fail, Succeed, Succeed, Succeed, Succeed]);
    let ctx = QueryContext::background();

    // Distinct variants so the healthy sources never answer from cache.
    for pos in 0..3 {
        let variant = Variant::new("2", 47_403_000 + pos, "C", "T");
        harness.aggregator.gather_evidence(&ctx, &variant).await.unwrap();
    }
    assert_eq!(harness.gnomad.calls(), 3);

    let snapshots = harness.aggregator.circuit_breaker_snapshots();
    let gnomad = snapshots.iter().find(|s| s.name == "gnomAD").unwrap();
    assert_eq!(gnomad.state, CircuitState::Open);

    let bundle = harness
        .aggregator
        .gather_evidence(&ctx, &Variant::new("2", 47_500_000, "C", "T"))
        .await
        .unwrap();
    assert!(!bundle.has(EvidenceKind::PopulationFrequency));
    assert_eq!(harness.gnomad.calls(), 3, "open breaker must not call the source");

    let health = harness.aggregator.health_check(&ctx).await;
    assert!(!health.is_healthy());
    assert_eq!(health.services.get("gnomAD"), Some(&false));
    assert_eq!(health.services.get("ClinVar"), Some(&true));
    assert!(health.cache_healthy);
}

#[tokio::test]
async fn test_invalidate_cache_forces_refetch() {
    let harness = Harness::new([Succeed; 6]);
    let ctx = QueryContext::background();
    let variant = brca1_variant();

    harness.aggregator.gather_evidence(&ctx, &variant).await.unwrap();
    assert_eq!(harness.aggregator.invalidate_cache(&variant).await.unwrap(), 6);
    harness.aggregator.gather_evidence(&ctx, &variant).await.unwrap();
    assert_eq!(harness.total_calls(), 12);
}

#[tokio::test]
async fn test_per_kind_queries_share_the_cache() {
    let harness = Harness::new([Succeed; 6]);
    let ctx = QueryContext::background();
    let variant = brca1_variant();

    harness.aggregator.query_hgmd(&ctx, &variant).await.unwrap();
    harness.aggregator.query_pubmed(&ctx, &variant).await.unwrap();
    harness.aggregator.gather_evidence(&ctx, &variant).await.unwrap();
    assert_eq!(harness.hgmd.calls(), 1);
    assert_eq!(harness.pubmed.calls(), 1);
    assert_eq!(harness.total_calls(), 6);
}

/// Memory backend whose operations can be made to fail on demand.
#[derive(Debug, Default)]
struct FlakyBackend {
    inner: MemoryCacheBackend,
    fail_next_get: AtomicBool,
    fail_sets: AtomicBool,
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_next_get.swap(false, Ordering::SeqCst) {
            return Err(EvidenceError::Cache("connection refused".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(EvidenceError::Cache("read-only replica".into()));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.inner.delete(keys).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.inner.delete_prefix(prefix).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }
}

fn tripping_breaker(name: &str) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        name,
        BreakerSettings {
            max_half_open_requests: 1,
            interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(60),
            trip: TripCondition::ConsecutiveFailures(1),
        },
    ))
}

#[tokio::test]
async fn test_open_breaker_serves_cached_fallback() {
    let backend = Arc::new(FlakyBackend::default());
    let cache = CacheStore::new(backend.clone(), Duration::from_secs(3600));
    let source = Scripted::<ClinVarData>::new(Fail);
    let client = ResilientServiceClient::new(
        source.clone(),
        tripping_breaker("ClinVar"),
        cache.clone(),
        Duration::from_secs(3600),
    );
    let ctx = QueryContext::background();
    let variant = brca1_variant();

    let err = client.query(&ctx, &variant).await.unwrap_err();
    assert!(matches!(err, EvidenceError::SourceFailed { .. }));
    assert_eq!(client.breaker().state(), CircuitState::Open);

    // Another replica filled the cache meanwhile; our first read of it fails.
    let cached = ClinVarData {
        variation_id: "55407".into(),
        clinical_significance: "Pathogenic".into(),
        ..Default::default()
    };
    cache
        .set(
            &CacheKey::for_variant(EvidenceKind::ClinicalSignificance, &variant),
            &cached,
            None,
        )
        .await
        .unwrap();
    backend.fail_next_get.store(true, Ordering::SeqCst);

    let served = client.query(&ctx, &variant).await.unwrap();
    assert_eq!(served, cached);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn test_cache_write_failure_still_returns_data() {
    let backend = Arc::new(FlakyBackend::default());
    backend.fail_sets.store(true, Ordering::SeqCst);
    let cache = CacheStore::new(backend, Duration::from_secs(3600));
    let source = Scripted::<LovdData>::new(Succeed);
    let client = ResilientServiceClient::new(
        source.clone(),
        tripping_breaker("LOVD"),
        cache.clone(),
        Duration::from_secs(3600),
    );
    let ctx = QueryContext::background();

    client.query(&ctx, &brca1_variant()).await.unwrap();
    client.query(&ctx, &brca1_variant()).await.unwrap();
    assert_eq!(source.calls(), 2);
    assert_eq!(cache.stats().errors, 2);
}

#[tokio::test]
async fn test_breaker_recovers_after_open_timeout() {
    tokio::time::pause();
    let cache = CacheStore::new(
        Arc::new(MemoryCacheBackend::new()),
        Duration::from_secs(3600),
    );
    let source = Scripted::<SomaticData>::new(Fail);
    let client = ResilientServiceClient::new(
        source.clone(),
        tripping_breaker("COSMIC"),
        cache,
        Duration::from_secs(3600),
    );
    let ctx = QueryContext::background();

    assert!(client.query(&ctx, &brca1_variant()).await.is_err());
    let err = client.query(&ctx, &brca1_variant()).await.unwrap_err();
    assert!(matches!(err, EvidenceError::ServiceUnavailable { .. }));

    source.failing.store(false, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(client.breaker().state(), CircuitState::HalfOpen);
    client.query(&ctx, &brca1_variant()).await.unwrap();
    assert_eq!(client.breaker().state(), CircuitState::Closed);
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_impatient_callers_do_not_open_the_breaker() {
    let cache = CacheStore::new(
        Arc::new(MemoryCacheBackend::new()),
        Duration::from_secs(3600),
    );
    let source = Scripted::<ClinVarData>::new(Stall);
    let client = resilient(source.clone(), &cache);

    for i in 0..10 {
        let err = if i % 2 == 0 {
            let (ctx, handle) = QueryContext::cancellable();
            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                handle.cancel();
            });
            let err = client.query(&ctx, &brca1_variant()).await.unwrap_err();
            canceller.await.unwrap();
            assert!(matches!(err, EvidenceError::Cancelled), "call {i}: {err}");
            err
        } else {
            let ctx = QueryContext::with_timeout(Duration::from_millis(5));
            let err = client.query(&ctx, &brca1_variant()).await.unwrap_err();
            assert!(matches!(err, EvidenceError::DeadlineExceeded), "call {i}: {err}");
            err
        };
        assert_eq!(client.breaker().state(), CircuitState::Closed, "after {err}");
    }

    assert_eq!(source.calls(), 10, "every call reached the source");
    let snapshot = client.breaker().snapshot();
    assert_eq!(snapshot.total_failures, 0);
    assert_eq!(snapshot.total_released, 10);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_gathers_do_not_open_the_breaker() {
    let harness = Harness::new([Succeed, Succeed, Stall, Succeed, Succeed, Succeed]);
    let aggregator = harness
        .aggregator
        .clone()
        .with_gather_timeout(Duration::from_secs(5));

    for pos in 0..4 {
        let variant = Variant::new("7", 117_559_590 + pos, "A", "G");
        let err = aggregator
            .gather_evidence(&QueryContext::background(), &variant)
            .await
            .unwrap_err();
        assert!(matches!(err, EvidenceError::DeadlineExceeded));
    }

    // Let the aborted tasks unwind.
    tokio::task::yield_now().await;
    let snapshots = aggregator.circuit_breaker_snapshots();
    let cosmic = snapshots.iter().find(|s| s.name == "COSMIC").unwrap();
    assert_eq!(cosmic.state, CircuitState::Closed);
    assert_eq!(cosmic.total_failures, 0);
    assert_eq!(harness.cosmic.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_still_counts_as_failure() {
    let cache = CacheStore::new(
        Arc::new(MemoryCacheBackend::new()),
        Duration::from_secs(3600),
    );
    let source = Scripted::<LovdData>::new(Stall);
    let client = resilient(source.clone(), &cache).with_timeout(Duration::from_secs(1));
    let ctx = QueryContext::background();

    for _ in 0..3 {
        let err = client.query(&ctx, &brca1_variant()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
    assert_eq!(client.breaker().state(), CircuitState::Open);
    assert_eq!(source.calls(), 3);
}
