//! Evidence source adapters
//!
//! An [`ExternalSourceClient`] is the only thing a concrete knowledge-base
//! integration has to provide. Caching, breaking and fan-out are layered on
//! top by [`crate::client::ResilientServiceClient`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::QueryContext;
use crate::error::Result;
use crate::evidence::Evidence;
use crate::resilience::RateLimiter;
use crate::variant::Variant;

/// One external knowledge source returning a single payload type.
#[async_trait]
pub trait ExternalSourceClient: Send + Sync {
    type Data: Evidence;

    fn name(&self) -> &str {
        <Self::Data as Evidence>::KIND.service_name()
    }

    async fn query(&self, ctx: &QueryContext, variant: &Variant) -> Result<Self::Data>;

    async fn health_check(&self, _ctx: &QueryContext) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T> ExternalSourceClient for Arc<T>
where
    T: ExternalSourceClient + ?Sized,
{
    type Data = T::Data;

    fn name(&self) -> &str {
        (**self).name()
    }

    async fn query(&self, ctx: &QueryContext, variant: &Variant) -> Result<Self::Data> {
        (**self).query(ctx, variant).await
    }

    async fn health_check(&self, ctx: &QueryContext) -> Result<()> {
        (**self).health_check(ctx).await
    }
}

/// Takes a token from a shared [`RateLimiter`] before every outbound query.
pub struct RateLimitedSource<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
}

impl<C> RateLimitedSource<C> {
    pub fn new(inner: C, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl<C: ExternalSourceClient> ExternalSourceClient for RateLimitedSource<C> {
    type Data = C::Data;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn query(&self, ctx: &QueryContext, variant: &Variant) -> Result<Self::Data> {
        self.limiter.acquire(ctx).await?;
        self.inner.query(ctx, variant).await
    }

    async fn health_check(&self, ctx: &QueryContext) -> Result<()> {
        self.inner.health_check(ctx).await
    }
}
