//! Bounded polling primitives
//!
//! Every place the bring-up flow must await external state goes through
//! [`wait`] or [`wait_phases`] - there are no bare fixed delays. Waits use a
//! monotonic clock, report elapsed time either way, and compose under one
//! shared budget so chained phases cannot inflate the caller's deadline.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// One bounded wait: what to call it, how long to try, how often to look.
///
/// Immutable per call. The interval is caller-tunable: sub-second for fast
/// transitions (pod phase), multi-second for slow convergence (workload
/// readiness).
#[derive(Debug, Clone)]
pub struct PollSpec {
    /// Label used in logs and timeout errors
    pub label: String,
    /// Maximum time to wait
    pub timeout: Duration,
    /// Time between predicate evaluations
    pub interval: Duration,
}

impl PollSpec {
    /// Create a poll spec
    pub fn new(label: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        Self {
            label: label.into(),
            timeout,
            interval,
        }
    }
}

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Predicate became true
    Ready {
        /// Time from call to satisfaction
        elapsed: Duration,
    },
    /// Budget exhausted with the predicate still false
    TimedOut {
        /// Time spent before giving up
        elapsed: Duration,
    },
}

impl WaitOutcome {
    /// Whether the wait succeeded
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready { .. })
    }

    /// Elapsed time regardless of outcome
    pub fn elapsed(&self) -> Duration {
        match self {
            WaitOutcome::Ready { elapsed } | WaitOutcome::TimedOut { elapsed } => *elapsed,
        }
    }
}

/// Wait until `predicate` returns true or the spec's timeout expires.
///
/// The predicate is evaluated immediately, then every `interval` until
/// elapsed time reaches `timeout`. Returns [`WaitOutcome::TimedOut`] at the
/// deadline, never earlier.
pub async fn wait<F, Fut>(spec: &PollSpec, mut predicate: F) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if predicate().await {
            let elapsed = start.elapsed();
            debug!(wait = %spec.label, ?elapsed, "condition met");
            return WaitOutcome::Ready { elapsed };
        }
        let elapsed = start.elapsed();
        if elapsed >= spec.timeout {
            debug!(wait = %spec.label, ?elapsed, "timed out");
            return WaitOutcome::TimedOut { elapsed };
        }
        trace!(wait = %spec.label, "condition not yet met");
        tokio::time::sleep(spec.interval).await;
    }
}

/// A stored predicate for composite waits
pub type PhasePredicate = Box<dyn FnMut() -> BoxFuture<'static, bool> + Send>;

/// One phase of a composite wait
pub struct PollPhase {
    /// Label for logs
    pub label: String,
    /// Time between predicate evaluations within this phase
    pub interval: Duration,
    /// Condition that ends this phase
    pub predicate: PhasePredicate,
}

impl PollPhase {
    /// Create a phase from a label, interval, and predicate closure
    pub fn new<F>(label: impl Into<String>, interval: Duration, predicate: F) -> Self
    where
        F: FnMut() -> BoxFuture<'static, bool> + Send + 'static,
    {
        Self {
            label: label.into(),
            interval,
            predicate: Box::new(predicate),
        }
    }
}

/// Run phases in order under one shared budget.
///
/// Each phase's effective timeout is the budget remainder, never an
/// independent timeout of its own. If the remainder is zero before a phase
/// starts, that phase - and the whole call - fails immediately without
/// evaluating its predicate.
pub async fn wait_phases(total_budget: Duration, phases: Vec<PollPhase>) -> WaitOutcome {
    let start = Instant::now();
    for mut phase in phases {
        // saturating_sub clamps the remainder at zero
        let remaining = total_budget.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            warn!(
                phase = %phase.label,
                budget = ?total_budget,
                "budget exhausted before phase started"
            );
            return WaitOutcome::TimedOut {
                elapsed: start.elapsed(),
            };
        }
        let spec = PollSpec::new(phase.label.clone(), remaining, phase.interval);
        if let WaitOutcome::TimedOut { .. } = wait(&spec, || (phase.predicate)()).await {
            return WaitOutcome::TimedOut {
                elapsed: start.elapsed(),
            };
        }
    }
    WaitOutcome::Ready {
        elapsed: start.elapsed(),
    }
}
