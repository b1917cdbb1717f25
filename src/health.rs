//! Health classification
//!
//! Pure mapping from a probe snapshot to the small health taxonomy the gate
//! and lifecycle flows act on. The ordering is a strict decision tree:
//! existence wins over readiness, readiness wins over declarative phase
//! text.

use std::fmt;

use serde_json::Value;

use crate::probe::ProbeSnapshot;

/// Health of one reconcilable service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Release does not exist (or the probe could not reach the cluster)
    NotInstalled,
    /// Release reports a pending phase (install/upgrade in flight)
    Pending,
    /// Release is deployed but replicas are not yet ready
    Starting,
    /// All desired replicas ready
    Healthy,
    /// Release reports a failed phase
    Failed,
    /// Release exists but its phase is unrecognized
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::NotInstalled => "not installed",
            HealthState::Pending => "pending",
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Failed => "failed",
            HealthState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classify a snapshot.
///
/// 1. No release → `NotInstalled`, regardless of anything else.
/// 2. All desired replicas ready → `Healthy`, regardless of phase text.
/// 3. Otherwise the release's declarative phase decides.
pub fn classify(snapshot: &ProbeSnapshot) -> HealthState {
    if !snapshot.exists {
        return HealthState::NotInstalled;
    }
    if snapshot.total > 0 && snapshot.ready == snapshot.total {
        return HealthState::Healthy;
    }
    match snapshot.raw_status.get("status").and_then(Value::as_str) {
        Some("deployed") => HealthState::Starting,
        Some("failed") => HealthState::Failed,
        Some(phase) if phase.starts_with("pending") => HealthState::Pending,
        _ => HealthState::Unknown,
    }
}
