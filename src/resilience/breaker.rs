//! Circuit breaker
//!
//! A breaker guards one dependency. While `Closed` it counts outcomes inside a
//! rolling window and trips to `Open` once its [`TripCondition`] holds. While
//! `Open` every call is rejected with [`EvidenceError::CircuitOpen`] without
//! touching the dependency. After `open_timeout` it admits a bounded number of
//! `HalfOpen` trials: enough consecutive successes close it again, a single
//! failure re-opens it.
//!
//! Every state change starts a new generation; outcomes of calls admitted in an
//! earlier generation are discarded. A call that ends because its caller gave
//! up (`Cancelled`, `DeadlineExceeded`, or the future being dropped) is
//! released: it is not recorded as a success or a failure, and its half-open
//! slot is handed back.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EvidenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// When a closed breaker should trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripCondition {
    /// Trip once the window holds at least `min_requests` and the failure ratio reaches `ratio`.
    FailureRatio { min_requests: u32, ratio: f64 },
    /// Trip after this many failures in a row.
    ConsecutiveFailures(u32),
}

impl TripCondition {
    fn should_trip(&self, counts: &Counts) -> bool {
        match *self {
            TripCondition::FailureRatio {
                min_requests,
                ratio,
            } => {
                counts.requests >= min_requests
                    && counts.requests > 0
                    && f64::from(counts.total_failures) / f64::from(counts.requests) >= ratio
            }
            TripCondition::ConsecutiveFailures(n) => counts.consecutive_failures >= n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Trial calls admitted while half-open; also the successes needed to close.
    pub max_half_open_requests: u32,
    /// Rolling window after which closed-state counts reset. Zero disables resets.
    pub interval: Duration,
    /// Time spent open before trials are admitted.
    pub open_timeout: Duration,
    pub trip: TripCondition,
}

impl BreakerSettings {
    /// Public, read-only knowledge bases.
    pub fn public_source() -> Self {
        Self {
            max_half_open_requests: 5,
            interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(60),
            trip: TripCondition::FailureRatio {
                min_requests: 3,
                ratio: 0.6,
            },
        }
    }

    /// Rate-sensitive or licensed sources trip earlier and probe more carefully.
    pub fn sensitive_source() -> Self {
        Self {
            max_half_open_requests: 3,
            trip: TripCondition::FailureRatio {
                min_requests: 2,
                ratio: 0.5,
            },
            ..Self::public_source()
        }
    }

    /// Slow commercial services get a longer cool-down.
    pub fn commercial_source() -> Self {
        Self {
            open_timeout: Duration::from_secs(90),
            ..Self::sensitive_source()
        }
    }

    /// The outer breaker around the gene failover chain.
    pub fn failover_chain() -> Self {
        Self {
            max_half_open_requests: 3,
            interval: Duration::from_secs(10),
            open_timeout: Duration::from_secs(5),
            trip: TripCondition::ConsecutiveFailures(5),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::public_source()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    requests: u32,
    total_successes: u32,
    total_failures: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a breaker for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window_requests: u32,
    pub window_successes: u32,
    pub window_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub total_released: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    total_released: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateChange>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        let expiry = (!settings.interval.is_zero()).then(|| Instant::now() + settings.interval);
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
                opened_at: None,
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                total_released: 0,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Receive state transitions. Lagging receivers drop old events; senders never wait.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.counts.consecutive_failures,
            consecutive_successes: inner.counts.consecutive_successes,
            window_requests: inner.counts.requests,
            window_successes: inner.counts.total_successes,
            window_failures: inner.counts.total_failures,
            opened_at: inner.opened_at,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            total_released: inner.total_released,
        }
    }

    /// Run `op` if the breaker admits it and record the outcome.
    ///
    /// `Cancelled` and `DeadlineExceeded` belong to the caller, not the
    /// dependency, and release the call instead of counting it.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = self.before_request()?;
        let mut guard = CallGuard {
            breaker: self,
            generation,
            settled: false,
        };
        let result = op().await;
        guard.settle(match &result {
            Ok(_) => Settlement::Success,
            Err(EvidenceError::Cancelled | EvidenceError::DeadlineExceeded) => Settlement::Released,
            Err(_) => Settlement::Failure,
        });
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_request(&self) -> Result<u64> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        let saturated = inner.state == CircuitState::HalfOpen
            && inner.counts.requests >= self.settings.max_half_open_requests;
        if inner.state == CircuitState::Open || saturated {
            inner.total_rejections += 1;
            debug!(breaker = %self.name, state = %inner.state, "call rejected");
            return Err(EvidenceError::CircuitOpen {
                name: self.name.clone(),
            });
        }
        inner.counts.requests += 1;
        inner.total_requests += 1;
        Ok(inner.generation)
    }

    fn after_request(&self, generation: u64, settlement: Settlement) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        let success = match settlement {
            Settlement::Success => {
                inner.total_successes += 1;
                true
            }
            Settlement::Failure => {
                inner.total_failures += 1;
                false
            }
            Settlement::Released => {
                inner.total_released += 1;
                if inner.generation == generation {
                    inner.counts.requests = inner.counts.requests.saturating_sub(1);
                }
                debug!(breaker = %self.name, "call released by its caller");
                return;
            }
        };
        if inner.generation != generation {
            return;
        }
        if success {
            inner.counts.on_success();
            if inner.state == CircuitState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_half_open_requests
            {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        } else {
            match inner.state {
                CircuitState::Closed => {
                    inner.counts.on_failure();
                    if self.settings.trip.should_trip(&inner.counts) {
                        self.transition(&mut inner, CircuitState::Open, now);
                    }
                }
                CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
                CircuitState::Open => {}
            }
        }
    }

    /// Apply time-driven changes: window rollover when closed, cool-down end when open.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.transition(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);
        let at = Utc::now();
        match to {
            CircuitState::Open => inner.opened_at = Some(at),
            CircuitState::Closed => inner.opened_at = None,
            CircuitState::HalfOpen => {}
        }
        warn!(breaker = %self.name, from = %from, to = %to, "circuit breaker state changed");
        // No receivers is fine.
        let _ = self.events.send(StateChange {
            name: self.name.clone(),
            from,
            to,
            at,
        });
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed if self.settings.interval.is_zero() => None,
            CircuitState::Closed => Some(now + self.settings.interval),
            CircuitState::Open => Some(now + self.settings.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Success,
    Failure,
    /// The caller stopped waiting; nothing is learned about the dependency.
    Released,
}

struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, settlement: Settlement) {
        self.settled = true;
        self.breaker.after_request(self.generation, settlement);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.after_request(self.generation, Settlement::Released);
        }
    }
}
