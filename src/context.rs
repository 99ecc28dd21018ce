//! # Request Context
//!
//! Every outbound call carries a [`QueryContext`]: an optional deadline plus a
//! cancellation signal owned by the caller. Rate-limiter waits, network calls
//! and the fan-out join all race their work against it via [`QueryContext::run`].
//!
//! ```rust
//! use std::time::Duration;
//! use variant_evidence::context::QueryContext;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ctx = QueryContext::with_timeout(Duration::from_millis(50));
//! let out = ctx.run(async { 7 }).await;
//! assert_eq!(out.unwrap(), 7);
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{EvidenceError, Result};

/// Handle used by the caller to cancel every call sharing a context.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails even when no receiver is left
        self.tx.send_replace(true);
    }
}

/// Deadline and cancellation carried through a gather or resolution.
#[derive(Debug, Clone)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancelled: watch::Receiver<bool>,
    // Keeps the channel open for contexts created without a handle.
    _tx: Option<Arc<watch::Sender<bool>>>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::background()
    }
}

impl QueryContext {
    /// A context with no deadline that can never be cancelled.
    pub fn background() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            deadline: None,
            cancelled: rx,
            _tx: Some(Arc::new(tx)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().child_with_deadline(deadline)
    }

    /// A fresh context plus the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (
            Self {
                deadline: None,
                cancelled: rx,
                _tx: Some(tx.clone()),
            },
            CancelHandle { tx },
        )
    }

    /// Derive a context sharing cancellation but with a deadline no later than `deadline`.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancelled: self.cancelled.clone(),
            _tx: self._tx.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Error describing why this context is done, if it is.
    pub fn err(&self) -> Option<EvidenceError> {
        if self.is_cancelled() {
            return Some(EvidenceError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(EvidenceError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Clamp a per-call timeout to the remaining deadline.
    pub fn clamp_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        match (timeout, self.remaining()) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (Some(t), None) => Some(t),
            (None, r) => r,
        }
    }

    /// Drive `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let mut cancelled = self.cancelled.clone();
        let cancel = async move {
            loop {
                if *cancelled.borrow_and_update() {
                    return;
                }
                if cancelled.changed().await.is_err() {
                    // Sender gone: cancellation can no longer happen.
                    futures::future::pending::<()>().await;
                }
            }
        };
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            out = fut => Ok(out),
            _ = cancel => Err(EvidenceError::Cancelled),
            _ = deadline => Err(EvidenceError::DeadlineExceeded),
        }
    }
}
