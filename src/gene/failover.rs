//! Priority-ordered failover across the gene services

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use super::{
    GeneService, GeneSource, GeneValidationResult, RateLimitedGeneSource, ServiceHealth,
    TranscriptInfo,
};
use crate::config::{GeneResolutionConfig, GeneServiceConfig};
use crate::context::QueryContext;
use crate::error::{EvidenceError, Result};
use crate::resilience::{BreakerSettings, CircuitBreaker, CircuitBreakerSnapshot, RateLimiter};
use crate::variant::Variant;

/// Gene used to probe service health.
const HEALTH_PROBE_SYMBOL: &str = "BRCA1";

struct Backend {
    source: Arc<dyn GeneSource>,
    timeout: Option<Duration>,
}

/// Tries HGNC, then RefSeq, then Ensembl, returning the first answer.
///
/// The whole chain runs inside one circuit breaker: when it keeps failing end
/// to end, later calls fail fast with [`EvidenceError::CircuitOpen`].
pub struct GeneResolutionClient {
    backends: Vec<Backend>,
    breaker: Arc<CircuitBreaker>,
}

impl GeneResolutionClient {
    /// Services are tried in the order given.
    pub fn new(
        hgnc: Arc<dyn GeneSource>,
        refseq: Arc<dyn GeneSource>,
        ensembl: Arc<dyn GeneSource>,
        breaker: BreakerSettings,
    ) -> Self {
        let backends = [hgnc, refseq, ensembl]
            .into_iter()
            .map(|source| Backend {
                source,
                timeout: None,
            })
            .collect();
        Self {
            backends,
            breaker: Arc::new(CircuitBreaker::new("gene-resolution", breaker)),
        }
    }

    /// Rate-limit and time-bound each service as configured.
    pub fn from_config(
        config: &GeneResolutionConfig,
        hgnc: Arc<dyn GeneSource>,
        refseq: Arc<dyn GeneSource>,
        ensembl: Arc<dyn GeneSource>,
    ) -> Self {
        let refseq_config = GeneServiceConfig {
            rate_limit: config.refseq_rate_limit(),
            ..config.refseq.clone()
        };
        let backends = [
            (hgnc, &config.hgnc),
            (refseq, &refseq_config),
            (ensembl, &config.ensembl),
        ]
        .into_iter()
        .map(|(source, service)| {
            let name = source.service().as_str();
            let limiter = Arc::new(RateLimiter::new(name, service.rate_limit, service.burst));
            Backend {
                source: Arc::new(RateLimitedGeneSource::new(source, limiter)),
                timeout: (!service.timeout.is_zero()).then_some(service.timeout),
            }
        })
        .collect();
        Self {
            backends,
            breaker: Arc::new(CircuitBreaker::new("gene-resolution", config.breaker)),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn circuit_breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// First canonical transcript any service returns.
    pub async fn get_canonical_transcript(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<TranscriptInfo> {
        self.breaker
            .execute(move || {
                self.try_in_order(ctx, symbol, "transcript resolution", move |source| {
                    source.get_canonical_transcript(ctx, symbol)
                })
            })
            .await
    }

    /// First validation any service returns. When every service fails the
    /// answer is a negative result listing each error, not an `Err`.
    pub async fn validate_gene_symbol(
        &self,
        ctx: &QueryContext,
        symbol: &str,
    ) -> Result<GeneValidationResult> {
        let outcome = self
            .breaker
            .execute(move || {
                self.try_in_order(ctx, symbol, "gene validation", move |source| {
                    source.validate_gene_symbol(ctx, symbol)
                })
            })
            .await;
        match outcome {
            Err(EvidenceError::TranscriptResolution { failures, .. }) => {
                let errors = failures
                    .into_iter()
                    .map(|(service, err)| format!("{}: {}", service, err))
                    .collect();
                Ok(GeneValidationResult::unverified(errors))
            }
            other => other,
        }
    }

    /// Gene services hold no variant data.
    pub async fn search_gene_variants(
        &self,
        _ctx: &QueryContext,
        symbol: &str,
    ) -> Result<Vec<Variant>> {
        Err(EvidenceError::Unsupported {
            operation: format!(
                "variant search for {}: gene services hold no variant data, query a variant database",
                symbol
            ),
        })
    }

    /// Validate a well-known gene against each service directly, bypassing the breaker.
    pub async fn service_health(&self, ctx: &QueryContext) -> Vec<ServiceHealth> {
        let mut report = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let service = backend.source.service();
            let outcome = call_with_timeout(ctx, service, backend.timeout, || {
                backend.source.validate_gene_symbol(ctx, HEALTH_PROBE_SYMBOL)
            })
            .await;
            let error = outcome.err().map(|e| {
                warn!(service = %service, error = %e, "gene service health check failed");
                e.to_string()
            });
            report.push(ServiceHealth {
                service,
                healthy: error.is_none(),
                last_check: Utc::now(),
                error,
            });
        }
        report
    }

    async fn try_in_order<'a, T, F>(
        &'a self,
        ctx: &'a QueryContext,
        symbol: &'a str,
        operation: &'static str,
        call: F,
    ) -> Result<T>
    where
        F: Fn(&'a dyn GeneSource) -> BoxFuture<'a, Result<T>>,
    {
        let mut failures = Vec::with_capacity(self.backends.len());
        for (i, backend) in self.backends.iter().enumerate() {
            let service = backend.source.service();
            let outcome =
                call_with_timeout(ctx, service, backend.timeout, || call(&*backend.source)).await;
            match outcome {
                Ok(found) => {
                    if i > 0 {
                        info!(gene_symbol = symbol, service = %service, operation, "resolved after failover");
                    } else {
                        debug!(gene_symbol = symbol, service = %service, operation, "resolved");
                    }
                    return Ok(found);
                }
                Err(e @ (EvidenceError::Cancelled | EvidenceError::DeadlineExceeded)) => {
                    return Err(e)
                }
                Err(e) => {
                    if i + 1 == self.backends.len() {
                        error!(gene_symbol = symbol, service = %service, error = %e, operation, "all gene services failed");
                    } else {
                        debug!(gene_symbol = symbol, service = %service, error = %e, operation, "gene service failed, trying next");
                    }
                    failures.push((service, e.to_string()));
                }
            }
        }
        Err(EvidenceError::TranscriptResolution {
            symbol: symbol.to_string(),
            failures,
        })
    }
}

async fn call_with_timeout<'a, T, F>(
    ctx: &QueryContext,
    service: GeneService,
    timeout: Option<Duration>,
    call: F,
) -> Result<T>
where
    F: FnOnce() -> BoxFuture<'a, Result<T>>,
{
    let fut = call();
    let bounded = async move {
        match ctx.clamp_timeout(timeout) {
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                Err(ctx.err().unwrap_or_else(|| {
                    EvidenceError::transient(
                        service.as_str(),
                        format!("no response within {:?}", limit),
                    )
                }))
            }),
            None => fut.await,
        }
    };
    ctx.run(bounded).await.and_then(|r| r)
}
