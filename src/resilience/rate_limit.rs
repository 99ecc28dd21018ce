//! Token-bucket rate limiting for outbound calls

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};
use tracing::trace;

use crate::context::QueryContext;
use crate::error::{EvidenceError, Result};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Steady-rate limiter for one external service.
///
/// The bucket holds at most `burst` tokens (default 1) and refills at
/// `rate_per_second`. A non-positive rate disables throttling.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, rate_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            name: name.into(),
            rate: rate_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// One request per second per unit of `rate`, no burst.
    pub fn per_second(name: impl Into<String>, rate: f64) -> Self {
        Self::new(name, rate, 1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait_time().is_none()
    }

    /// Wait for a token, giving up when `ctx` is cancelled or its deadline passes.
    pub async fn acquire(&self, ctx: &QueryContext) -> Result<()> {
        loop {
            let Some(wait) = self.take_or_wait_time() else {
                return Ok(());
            };
            trace!(limiter = %self.name, wait_ms = wait.as_millis() as u64, "waiting for rate limit token");
            ctx.run(tokio::time::sleep(wait)).await?;
        }
    }

    /// `None` when a token was taken, otherwise how long until one is available.
    fn take_or_wait_time(&self) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            Some(Duration::from_secs_f64(missing / self.rate))
        }
    }
}

/// Requests that carry a [`QueryContext`].
pub trait HasContext {
    fn context(&self) -> &QueryContext;
}

/// Tower layer that acquires a token from a shared limiter before each call.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimit<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;
    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

impl<S, Req> Service<Req> for RateLimit<S>
where
    Req: HasContext + Send + 'static,
    S: Service<Req, Error = EvidenceError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = EvidenceError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        // Readiness of the inner service is awaited after the token is acquired.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let ctx = req.context().clone();
            limiter.acquire(&ctx).await?;
            inner.ready().await?.call(req).await
        })
    }
}
