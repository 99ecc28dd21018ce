//! Resilient per-service client
//!
//! [`ResilientServiceClient`] composes one source adapter with its circuit
//! breaker and the shared cache:
//!
//! 1. cache lookup; a hit returns without touching the network
//! 2. breaker-gated query with a per-call timeout
//! 3. best-effort write-back of a successful result
//! 4. when the breaker is open, one degraded cache lookup before giving up
//!
//! Cache failures never fail a query; they are logged and treated as misses.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tower::Service;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::config::ServiceConfig;
use crate::context::QueryContext;
use crate::error::{EvidenceError, Result};
use crate::evidence::{Evidence, EvidenceKind};
use crate::resilience::{CircuitBreaker, HasContext, RateLimiter};
use crate::source::{ExternalSourceClient, RateLimitedSource};
use crate::variant::Variant;

pub struct ResilientServiceClient<D: Evidence> {
    source: Arc<dyn ExternalSourceClient<Data = D>>,
    breaker: Arc<CircuitBreaker>,
    cache: CacheStore,
    ttl: Duration,
    call_timeout: Option<Duration>,
}

impl<D: Evidence> Clone for ResilientServiceClient<D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            breaker: self.breaker.clone(),
            cache: self.cache.clone(),
            ttl: self.ttl,
            call_timeout: self.call_timeout,
        }
    }
}

impl<D: Evidence> std::fmt::Debug for ResilientServiceClient<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientServiceClient")
            .field("service", &self.name())
            .field("breaker", &self.breaker.state())
            .field("ttl", &self.ttl)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<D: Evidence> ResilientServiceClient<D> {
    pub fn new(
        source: Arc<dyn ExternalSourceClient<Data = D>>,
        breaker: Arc<CircuitBreaker>,
        cache: CacheStore,
        ttl: Duration,
    ) -> Self {
        Self {
            source,
            breaker,
            cache,
            ttl,
            call_timeout: None,
        }
    }

    /// Build the client for one service: a rate limiter in front of `source`,
    /// and a breaker named after the service.
    pub fn from_config(
        source: Arc<dyn ExternalSourceClient<Data = D>>,
        cache: CacheStore,
        config: &ServiceConfig,
    ) -> Self {
        let name = D::KIND.service_name();
        let limiter = Arc::new(RateLimiter::new(name, config.rate_limit, config.burst));
        let limited: Arc<dyn ExternalSourceClient<Data = D>> =
            Arc::new(RateLimitedSource::new(source, limiter));
        let breaker = Arc::new(CircuitBreaker::new(name, config.breaker));
        Self::new(limited, breaker, cache, config.cache_ttl).with_timeout(config.timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn name(&self) -> &'static str {
        D::KIND.service_name()
    }

    pub fn kind(&self) -> EvidenceKind {
        D::KIND
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cache-aside query guarded by the service's circuit breaker.
    pub async fn query(&self, ctx: &QueryContext, variant: &Variant) -> Result<D> {
        let service = self.name();
        let key = CacheKey::for_variant(D::KIND, variant);

        match self.cache.get::<D>(&key).await {
            Ok(Some(hit)) => {
                debug!(service, key = %key, "cache hit");
                return Ok(hit);
            }
            Ok(None) => {}
            Err(e) => warn!(service, error = %e, "cache read failed, querying source"),
        }

        let source = &self.source;
        let timeout = ctx.clamp_timeout(self.call_timeout);
        let result = self
            .breaker
            .execute(|| async move {
                let call = async move {
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, source.query(ctx, variant))
                            .await
                            .unwrap_or_else(|_| {
                                // A limit clamped to the caller's deadline is the caller's timeout.
                                Err(ctx.err().unwrap_or_else(|| {
                                    EvidenceError::transient(
                                        service,
                                        format!("no response within {:?}", limit),
                                    )
                                }))
                            }),
                        None => source.query(ctx, variant).await,
                    }
                };
                ctx.run(call).await.and_then(|r| r)
            })
            .await;

        match result {
            Ok(data) => {
                if let Err(e) = self.cache.set(&key, &data, Some(self.ttl)).await {
                    warn!(service, error = %e, "failed to cache result");
                }
                Ok(data)
            }
            Err(e) if e.is_circuit_open() => match self.cache.get::<D>(&key).await {
                Ok(Some(stale)) => {
                    warn!(service, "circuit open, serving cached result");
                    Ok(stale)
                }
                Ok(None) => Err(EvidenceError::ServiceUnavailable {
                    service: service.to_string(),
                }),
                Err(cache_err) => {
                    warn!(service, error = %cache_err, "cache fallback failed");
                    Err(EvidenceError::ServiceUnavailable {
                        service: service.to_string(),
                    })
                }
            },
            Err(e @ (EvidenceError::Cancelled | EvidenceError::DeadlineExceeded)) => Err(e),
            Err(e) => Err(EvidenceError::SourceFailed {
                service: service.to_string(),
                source: Box::new(e),
            }),
        }
    }

    pub async fn health_check(&self, ctx: &QueryContext) -> Result<()> {
        self.source.health_check(ctx).await
    }

    pub async fn invalidate(&self, variant: &Variant) -> Result<()> {
        self.cache
            .invalidate(&CacheKey::for_variant(D::KIND, variant))
            .await
    }
}

/// A single source query, for use with tower middleware.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub ctx: QueryContext,
    pub variant: Variant,
}

impl SourceRequest {
    pub fn new(ctx: QueryContext, variant: Variant) -> Self {
        Self { ctx, variant }
    }
}

impl HasContext for SourceRequest {
    fn context(&self) -> &QueryContext {
        &self.ctx
    }
}

impl<D: Evidence> Service<SourceRequest> for ResilientServiceClient<D> {
    type Response = D;
    type Error = EvidenceError;
    type Future = BoxFuture<'static, Result<D>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SourceRequest) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.query(&req.ctx, &req.variant).await })
    }
}
