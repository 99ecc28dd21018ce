//! Resilience primitives: circuit breaker and rate limiter
//!
//! What this module provides
//! - Reusable guards that keep one failing or quota-bound dependency from
//!   dragging down the callers that share it
//!
//! Exports
//! - Models
//!   - `BreakerSettings { max_half_open_requests, interval, open_timeout, trip }`
//!   - `TripCondition::{FailureRatio, ConsecutiveFailures}`
//!   - `CircuitState`, `CircuitBreakerSnapshot`, `StateChange`
//! - Guards
//!   - `CircuitBreaker` (shared via `Arc`, one per service, process lifetime)
//!   - `RateLimiter` (token bucket, one per service)
//! - Layers
//!   - `RateLimitLayer` for any tower service whose request carries a `QueryContext`
//!
//! Implementation strategy
//! - Breaker: gobreaker-style generations over a `std::sync::Mutex`; the lock is
//!   never held across an `.await`, outcomes are recorded by an RAII guard
//! - Rate limit: token bucket refilled lazily on each acquisition; waiters sleep
//!   through `QueryContext::run` so cancellation and deadlines apply
//!
//! Testing strategy
//! - Paused tokio time (`start_paused`, `advance`) drives open timeouts, window
//!   rollover and refill without real sleeps

mod breaker;
mod rate_limit;

pub use breaker::{
    BreakerSettings, CircuitBreaker, CircuitBreakerSnapshot, CircuitState, StateChange,
    TripCondition,
};
pub use rate_limit::{HasContext, RateLimit, RateLimitLayer, RateLimiter};
