//! Concurrent evidence aggregation
//!
//! What this module provides
//! - One fan-out over all six resilient source clients per variant
//! - Partial results are success; only a total failure is an error
//!
//! Exports
//! - `SourceAdapters` (the six raw adapters) and `EvidenceSources` (their resilient clients)
//! - `EvidenceAggregator::{gather_evidence, query_*, circuit_breaker_snapshots, health_check, invalidate_cache, stats}`
//! - `HealthReport`, `AggregatorStats`
//!
//! Implementation strategy
//! - Each source runs as its own task on a `tokio::task::JoinSet`, inside a
//!   per-source span nested under the `gather_evidence` span
//! - The join loop is raced against the `QueryContext`; dropping the set on
//!   cancellation or deadline aborts the outstanding tasks
//! - A panicking source is caught inside its task and reported like any other failure
//!
//! Testing strategy
//! - Scripted sources that succeed, fail or stall; call counters assert cache-aside behaviour

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug_span, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CacheStats, CacheStore};
use crate::client::ResilientServiceClient;
use crate::config::EvidenceConfig;
use crate::context::QueryContext;
use crate::error::{EvidenceError, Result, SourceFailure};
use crate::evidence::{
    ClinVarData, Evidence, EvidenceBundle, EvidenceKind, HgmdData, LiteratureData, LovdData,
    PopulationData, SomaticData,
};
use crate::resilience::{CircuitBreakerSnapshot, CircuitState};
use crate::source::ExternalSourceClient;
use crate::variant::Variant;

/// The raw adapters for the six evidence sources.
pub struct SourceAdapters {
    pub clinvar: Arc<dyn ExternalSourceClient<Data = ClinVarData>>,
    pub gnomad: Arc<dyn ExternalSourceClient<Data = PopulationData>>,
    pub cosmic: Arc<dyn ExternalSourceClient<Data = SomaticData>>,
    pub pubmed: Arc<dyn ExternalSourceClient<Data = LiteratureData>>,
    pub lovd: Arc<dyn ExternalSourceClient<Data = LovdData>>,
    pub hgmd: Arc<dyn ExternalSourceClient<Data = HgmdData>>,
}

/// One resilient client per evidence kind.
#[derive(Debug, Clone)]
pub struct EvidenceSources {
    pub clinvar: ResilientServiceClient<ClinVarData>,
    pub gnomad: ResilientServiceClient<PopulationData>,
    pub cosmic: ResilientServiceClient<SomaticData>,
    pub pubmed: ResilientServiceClient<LiteratureData>,
    pub lovd: ResilientServiceClient<LovdData>,
    pub hgmd: ResilientServiceClient<HgmdData>,
}

impl EvidenceSources {
    /// Wrap each adapter with its configured limiter, breaker, timeout and TTL.
    pub fn from_config(adapters: SourceAdapters, config: &EvidenceConfig, cache: CacheStore) -> Self {
        let sources = &config.sources;
        Self {
            clinvar: ResilientServiceClient::from_config(
                adapters.clinvar,
                cache.clone(),
                &sources.clinvar,
            ),
            gnomad: ResilientServiceClient::from_config(
                adapters.gnomad,
                cache.clone(),
                &sources.gnomad,
            ),
            cosmic: ResilientServiceClient::from_config(
                adapters.cosmic,
                cache.clone(),
                &sources.cosmic,
            ),
            pubmed: ResilientServiceClient::from_config(
                adapters.pubmed,
                cache.clone(),
                &sources.pubmed,
            ),
            lovd: ResilientServiceClient::from_config(adapters.lovd, cache.clone(), &sources.lovd),
            hgmd: ResilientServiceClient::from_config(adapters.hgmd, cache, &sources.hgmd),
        }
    }

    pub fn circuit_breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        vec![
            self.clinvar.breaker().snapshot(),
            self.gnomad.breaker().snapshot(),
            self.cosmic.breaker().snapshot(),
            self.pubmed.breaker().snapshot(),
            self.lovd.breaker().snapshot(),
            self.hgmd.breaker().snapshot(),
        ]
    }
}

/// Result of [`EvidenceAggregator::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Service name to "breaker closed".
    pub services: BTreeMap<String, bool>,
    pub cache_healthy: bool,
    pub cache_error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.cache_healthy && self.services.values().all(|ok| *ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    pub cache: CacheStats,
}

enum Gathered {
    ClinVar(ClinVarData),
    Population(PopulationData),
    Somatic(SomaticData),
    Literature(LiteratureData),
    Lovd(LovdData),
    Hgmd(HgmdData),
}

impl Gathered {
    fn store(self, bundle: &mut EvidenceBundle) {
        match self {
            Gathered::ClinVar(d) => bundle.clinical_significance = Some(d),
            Gathered::Population(d) => bundle.population_frequency = Some(d),
            Gathered::Somatic(d) => bundle.somatic = Some(d),
            Gathered::Literature(d) => bundle.literature = Some(d),
            Gathered::Lovd(d) => bundle.gene_specific_database = Some(d),
            Gathered::Hgmd(d) => bundle.mutation_database = Some(d),
        }
    }
}

type Outcome = (EvidenceKind, Result<Gathered>);

fn spawn_query<D: Evidence>(
    set: &mut JoinSet<Outcome>,
    client: &ResilientServiceClient<D>,
    ctx: &QueryContext,
    variant: &Arc<Variant>,
    wrap: fn(D) -> Gathered,
) {
    let client = client.clone();
    let ctx = ctx.clone();
    let variant = variant.clone();
    let span = debug_span!("source_query", service = D::KIND.service_name());
    set.spawn(
        async move {
            let outcome = AssertUnwindSafe(client.query(&ctx, &variant))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(EvidenceError::transient(
                        D::KIND.service_name(),
                        "source query panicked",
                    ))
                });
            (D::KIND, outcome.map(wrap))
        }
        .instrument(span),
    );
}

/// Fans one variant out to every evidence source.
#[derive(Debug, Clone)]
pub struct EvidenceAggregator {
    sources: EvidenceSources,
    cache: CacheStore,
    gather_timeout: Option<Duration>,
}

impl EvidenceAggregator {
    pub fn new(sources: EvidenceSources, cache: CacheStore) -> Self {
        Self {
            sources,
            cache,
            gather_timeout: None,
        }
    }

    pub fn from_config(adapters: SourceAdapters, config: &EvidenceConfig, cache: CacheStore) -> Self {
        let sources = EvidenceSources::from_config(adapters, config, cache.clone());
        Self::new(sources, cache).with_gather_timeout(config.gather_timeout)
    }

    /// Bound every gather; the caller's own deadline still applies when earlier.
    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn sources(&self) -> &EvidenceSources {
        &self.sources
    }

    /// Query all six sources concurrently and collect whatever succeeded.
    ///
    /// Fails with [`EvidenceError::AggregateFailure`] only when every source
    /// failed, and with `Cancelled`/`DeadlineExceeded` when `ctx` ends first.
    pub async fn gather_evidence(
        &self,
        ctx: &QueryContext,
        variant: &Variant,
    ) -> Result<EvidenceBundle> {
        let gather_id = Uuid::new_v4();
        let span = info_span!(
            "gather_evidence",
            %gather_id,
            chromosome = %variant.chromosome,
            position = variant.position
        );
        self.gather(ctx, variant, gather_id).instrument(span).await
    }

    async fn gather(
        &self,
        ctx: &QueryContext,
        variant: &Variant,
        gather_id: Uuid,
    ) -> Result<EvidenceBundle> {
        let ctx = match self.gather_timeout {
            Some(timeout) => ctx.child_with_deadline(Instant::now() + timeout),
            None => ctx.clone(),
        };
        let variant = Arc::new(variant.clone());

        let mut set = JoinSet::new();
        let s = &self.sources;
        spawn_query(&mut set, &s.clinvar, &ctx, &variant, Gathered::ClinVar);
        spawn_query(&mut set, &s.gnomad, &ctx, &variant, Gathered::Population);
        spawn_query(&mut set, &s.cosmic, &ctx, &variant, Gathered::Somatic);
        spawn_query(&mut set, &s.pubmed, &ctx, &variant, Gathered::Literature);
        spawn_query(&mut set, &s.lovd, &ctx, &variant, Gathered::Lovd);
        spawn_query(&mut set, &s.hgmd, &ctx, &variant, Gathered::Hgmd);

        let mut bundle = EvidenceBundle::empty(gather_id, Utc::now());
        let mut failures: Vec<SourceFailure> = Vec::new();
        let mut lost_tasks = Vec::new();

        let collect = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(data))) => data.store(&mut bundle),
                    Ok((kind, Err(error))) => {
                        warn!(service = kind.service_name(), error = %error, "evidence source failed");
                        failures.push(SourceFailure { kind, error });
                    }
                    Err(join_err) => lost_tasks.push(join_err.to_string()),
                }
            }
        };
        // Dropping `set` on early return aborts whatever is still running.
        ctx.run(collect).await?;

        if !lost_tasks.is_empty() {
            for kind in EvidenceKind::ALL {
                let reported = bundle.has(kind) || failures.iter().any(|f| f.kind == kind);
                if !reported {
                    failures.push(SourceFailure {
                        kind,
                        error: EvidenceError::transient(kind.service_name(), lost_tasks.join("; ")),
                    });
                }
            }
        }

        if bundle.is_empty() {
            failures.sort_by_key(|f| EvidenceKind::ALL.iter().position(|k| *k == f.kind));
            error!(failed = failures.len(), "all evidence sources failed");
            return Err(EvidenceError::AggregateFailure { failures });
        }

        info!(
            populated = bundle.populated_kinds().len(),
            failed = failures.len(),
            "evidence gathered"
        );
        Ok(bundle)
    }

    pub async fn query_clinvar(&self, ctx: &QueryContext, variant: &Variant) -> Result<ClinVarData> {
        self.sources.clinvar.query(ctx, variant).await
    }

    pub async fn query_gnomad(
        &self,
        ctx: &QueryContext,
        variant: &Variant,
    ) -> Result<PopulationData> {
        self.sources.gnomad.query(ctx, variant).await
    }

    pub async fn query_cosmic(&self, ctx: &QueryContext, variant: &Variant) -> Result<SomaticData> {
        self.sources.cosmic.query(ctx, variant).await
    }

    pub async fn query_pubmed(
        &self,
        ctx: &QueryContext,
        variant: &Variant,
    ) -> Result<LiteratureData> {
        self.sources.pubmed.query(ctx, variant).await
    }

    pub async fn query_lovd(&self, ctx: &QueryContext, variant: &Variant) -> Result<LovdData> {
        self.sources.lovd.query(ctx, variant).await
    }

    pub async fn query_hgmd(&self, ctx: &QueryContext, variant: &Variant) -> Result<HgmdData> {
        self.sources.hgmd.query(ctx, variant).await
    }

    pub fn circuit_breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.sources.circuit_breaker_snapshots()
    }

    /// Breaker state per service plus a cache ping. Never calls the sources.
    pub async fn health_check(&self, ctx: &QueryContext) -> HealthReport {
        let services = self
            .circuit_breaker_snapshots()
            .into_iter()
            .map(|s| (s.name, s.state == CircuitState::Closed))
            .collect();
        let (cache_healthy, cache_error) = match ctx.run(self.cache.ping()).await.and_then(|r| r) {
            Ok(()) => (true, None),
            Err(e) => {
                warn!(error = %e, "cache health check failed");
                (false, Some(e.to_string()))
            }
        };
        HealthReport {
            services,
            cache_healthy,
            cache_error,
        }
    }

    /// Drop every cached payload for `variant`.
    pub async fn invalidate_cache(&self, variant: &Variant) -> Result<u64> {
        self.cache.invalidate_variant(variant).await
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            circuit_breakers: self.circuit_breaker_snapshots(),
            cache: self.cache.stats(),
        }
    }
}
