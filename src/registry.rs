//! Step timing registry
//!
//! An explicit registry instance owned by the orchestrator and passed to
//! whatever needs it - no process-wide mutable state. Records what happened
//! to each bring-up step and how long it took, and renders the converge
//! summary.

use std::fmt::Write as _;
use std::time::Duration;

use crate::gate::EnsureOutcome;

/// One recorded step
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Step name (service or operation)
    pub name: String,
    /// What the gate (or lifecycle flow) concluded
    pub outcome: EnsureOutcome,
    /// Wall time the step took
    pub elapsed: Duration,
}

/// Ordered record of all steps in one converge pass
#[derive(Debug, Default)]
pub struct TimingRegistry {
    records: Vec<StepRecord>,
}

impl TimingRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished step
    pub fn record(&mut self, name: impl Into<String>, outcome: EnsureOutcome, elapsed: Duration) {
        self.records.push(StepRecord {
            name: name.into(),
            outcome,
            elapsed,
        });
    }

    /// All records in execution order
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Whether any step failed
    pub fn any_failed(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.outcome == EnsureOutcome::Failed)
    }

    /// Total wall time across recorded steps
    pub fn total_elapsed(&self) -> Duration {
        self.records.iter().map(|r| r.elapsed).sum()
    }

    /// Render the converge summary table
    pub fn summary(&self) -> String {
        let width = self
            .records
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0)
            .max(4);
        let mut out = String::new();
        for record in &self.records {
            let _ = writeln!(
                out,
                "  {:width$}  {:8}  {:.1}s",
                record.name,
                record.outcome.to_string(),
                record.elapsed.as_secs_f64(),
                width = width
            );
        }
        let _ = writeln!(
            out,
            "  {:width$}  {:8}  {:.1}s",
            "total",
            "",
            self.total_elapsed().as_secs_f64(),
            width = width
        );
        out
    }
}
