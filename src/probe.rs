//! Point-in-time probes of external service state
//!
//! [`ProbeClient`] reads release existence, workload readiness counts, and
//! declarative status through the control plane, and the secret store's
//! init/seal state through an in-pod exec. Probes never fail: an
//! unreachable or garbled target collapses into a safe default document so
//! downstream consumers never need null-handling. Snapshots are produced
//! fresh on every call - never cached - so classification always reflects
//! current truth.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::control_plane::{ControlPlane, ExecTarget, QueryKind, ResourceQuery};

/// Workload whose readiness counts feed a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    /// Deployment or StatefulSet
    pub kind: QueryKind,
    /// Workload object name
    pub name: String,
}

/// Identifies what one probe reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Helm release name
    pub release: String,
    /// Namespace holding the release and workload
    pub namespace: String,
    /// Workload to count readiness from; None leaves counts at 0/0
    pub workload: Option<WorkloadRef>,
}

/// A point-in-time reading of one service's state
#[derive(Debug, Clone, Default)]
pub struct ProbeSnapshot {
    /// Whether the release exists at all
    pub exists: bool,
    /// Replicas currently ready
    pub ready: u32,
    /// Replicas desired
    pub total: u32,
    /// The release's declarative status document (helm `info` object)
    pub raw_status: Map<String, Value>,
    /// False when the control plane could not be reached
    pub reachable: bool,
}

impl ProbeSnapshot {
    /// Release does not exist; control plane answered
    fn absent() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    /// Control plane could not be reached; treated as not installed
    fn unreachable() -> Self {
        Self::default()
    }
}

/// The secret store's probed state document.
///
/// Unreachable or malformed responses default to "uninitialized and sealed",
/// the conservative reading that triggers no destructive action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    /// Whether the store has been initialized
    pub initialized: bool,
    /// Whether stored data is currently sealed
    pub sealed: bool,
    /// False when the status could not be read at all
    pub reachable: bool,
}

impl Default for StoreStatus {
    fn default() -> Self {
        Self {
            initialized: false,
            sealed: true,
            reachable: false,
        }
    }
}

/// Read-only probe executor
#[derive(Clone)]
pub struct ProbeClient {
    control_plane: Arc<dyn ControlPlane>,
}

impl ProbeClient {
    /// Create a probe client over the given control plane
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Take a fresh snapshot of one service.
    ///
    /// Never errors: absence and unreachability are both legal snapshots.
    pub async fn query(&self, target: &ProbeTarget) -> ProbeSnapshot {
        let release = ResourceQuery::release(&target.release, &target.namespace);
        let release_doc = match self.control_plane.query(&release).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return ProbeSnapshot::absent(),
            Err(e) => {
                warn!(
                    release = %target.release,
                    namespace = %target.namespace,
                    error = %e,
                    "probe unreachable, using default snapshot"
                );
                return ProbeSnapshot::unreachable();
            }
        };

        let raw_status = release_doc
            .get("info")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let (ready, total) = match &target.workload {
            Some(workload) => self.workload_counts(workload, &target.namespace).await,
            None => (0, 0),
        };

        ProbeSnapshot {
            exists: true,
            ready,
            total,
            raw_status,
            reachable: true,
        }
    }

    /// Ready/desired replica counts for a workload; absent or unreadable
    /// workloads count as 0/0.
    async fn workload_counts(&self, workload: &WorkloadRef, namespace: &str) -> (u32, u32) {
        let query = ResourceQuery::object(workload.kind, &workload.name, namespace);
        let doc = match self.control_plane.query(&query).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return (0, 0),
            Err(e) => {
                warn!(
                    workload = %workload.name,
                    namespace = %namespace,
                    error = %e,
                    "workload probe unreachable"
                );
                return (0, 0);
            }
        };

        let ready = doc
            .pointer("/status/readyReplicas")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let total = doc
            .pointer("/spec/replicas")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        (ready, total)
    }

    /// Probe the secret store's init/seal state via in-pod exec.
    ///
    /// `vault status` exits 2 when sealed, so the exit code is ignored as
    /// long as stdout parses; anything else yields the safe default.
    pub async fn secret_store_status(&self, target: &ExecTarget) -> StoreStatus {
        let command: Vec<String> = ["vault", "status", "-format=json"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let output = match self.control_plane.exec(target, &command, None).await {
            Ok(output) => output,
            Err(e) => {
                warn!(pod = %target.pod, error = %e, "secret store unreachable");
                return StoreStatus::default();
            }
        };

        let doc: Value = match serde_json::from_str(&output.stdout) {
            Ok(doc) => doc,
            Err(_) => {
                warn!(
                    pod = %target.pod,
                    code = output.code,
                    "secret store status unparseable, using sealed default"
                );
                return StoreStatus::default();
            }
        };

        StoreStatus {
            initialized: doc
                .get("initialized")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            sealed: doc.get("sealed").and_then(Value::as_bool).unwrap_or(true),
            reachable: true,
        }
    }
}
