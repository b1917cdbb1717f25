//! Idempotent deployment gate
//!
//! [`DeploymentGate::ensure`] is the only path through which services are
//! (re)deployed: it classifies live state first and short-circuits to
//! [`EnsureOutcome::Skipped`] with zero mutating calls when the target is
//! already healthy. Health is never memoized across calls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::control_plane::{ControlPlane, ResourceApply};
use crate::health::{classify, HealthState};
use crate::poll::{self, PollSpec};
use crate::probe::{ProbeClient, ProbeTarget};
use crate::{Error, Result};

/// Bounded retry for applies racing admission-webhook propagation
pub const ADMISSION_MAX_ATTEMPTS: u32 = 3;
/// Fixed delay between admission-gated apply attempts
pub const ADMISSION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Result of one gate pass over a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Already healthy; no mutating call was issued
    Skipped,
    /// Applied and converged to healthy
    Applied,
    /// Applied but did not converge within the descriptor's wait
    Failed,
}

impl fmt::Display for EnsureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnsureOutcome::Skipped => "skipped",
            EnsureOutcome::Applied => "applied",
            EnsureOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Boxed async apply action over the control plane
pub type ApplyFn = Box<dyn Fn(Arc<dyn ControlPlane>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One reconcilable unit: how to probe it, how to apply it, how long to wait
pub struct ServiceDescriptor {
    /// Service name, used in logs and the timing registry
    pub name: String,
    /// Namespace the service lives in
    pub namespace: String,
    /// What the probe reads to derive health
    pub probe: ProbeTarget,
    /// Mutating action that upserts the service
    pub apply: ApplyFn,
    /// Bounded wait for convergence after apply
    pub wait: PollSpec,
}

impl ServiceDescriptor {
    /// Descriptor whose apply is a single control-plane upsert
    pub fn from_apply(
        name: impl Into<String>,
        namespace: impl Into<String>,
        probe: ProbeTarget,
        resource: ResourceApply,
        wait: PollSpec,
    ) -> Self {
        let apply: ApplyFn = Box::new(move |cp: Arc<dyn ControlPlane>| {
            let resource = resource.clone();
            Box::pin(async move { cp.apply(&resource).await })
        });
        Self {
            name: name.into(),
            namespace: namespace.into(),
            probe,
            apply,
            wait,
        }
    }
}

/// Idempotency wrapper around apply-and-wait
pub struct DeploymentGate {
    control_plane: Arc<dyn ControlPlane>,
    probe: ProbeClient,
}

impl DeploymentGate {
    /// Create a gate over the given control plane
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        let probe = ProbeClient::new(control_plane.clone());
        Self {
            control_plane,
            probe,
        }
    }

    /// Classify the service's live state from a fresh probe
    pub async fn health(&self, descriptor: &ServiceDescriptor) -> HealthState {
        classify(&self.probe.query(&descriptor.probe).await)
    }

    /// Ensure the service is deployed and healthy.
    ///
    /// Classifies first; `Healthy` returns `Skipped` with zero mutating
    /// calls. Otherwise applies, waits on the descriptor's spec, and
    /// re-classifies to confirm `Applied` vs `Failed`.
    pub async fn ensure(&self, descriptor: &ServiceDescriptor) -> Result<(EnsureOutcome, Duration)> {
        let start = Instant::now();

        let state = self.health(descriptor).await;
        if state == HealthState::Healthy {
            info!(service = %descriptor.name, "already healthy, skipping");
            return Ok((EnsureOutcome::Skipped, start.elapsed()));
        }

        info!(service = %descriptor.name, state = %state, "applying");
        (descriptor.apply)(self.control_plane.clone()).await?;

        let gate = &*self;
        let wait_outcome = poll::wait(&descriptor.wait, || async move {
            gate.health(descriptor).await == HealthState::Healthy
        })
        .await;
        if !wait_outcome.is_ready() {
            warn!(
                service = %descriptor.name,
                elapsed = ?wait_outcome.elapsed(),
                "did not converge within wait budget"
            );
        }

        let final_state = self.health(descriptor).await;
        let outcome = if final_state == HealthState::Healthy {
            EnsureOutcome::Applied
        } else {
            EnsureOutcome::Failed
        };
        info!(service = %descriptor.name, outcome = %outcome, state = %final_state, "ensure finished");
        Ok((outcome, start.elapsed()))
    }
}

/// Apply a manifest that an admission layer may transiently reject.
///
/// Retries a small bounded number of times with a fixed delay to ride out
/// webhook propagation races, then surfaces the failure. Callers with a
/// concrete readiness signal should wait on that predicate first and keep
/// this retry as the backstop.
pub async fn apply_admission_gated(
    control_plane: &dyn ControlPlane,
    apply: &ResourceApply,
) -> Result<()> {
    let label = apply.label();
    let mut last_error = String::new();

    for attempt in 1..=ADMISSION_MAX_ATTEMPTS {
        match control_plane.apply(apply).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = e.to_string();
                if attempt < ADMISSION_MAX_ATTEMPTS {
                    warn!(
                        resource = %label,
                        attempt,
                        error = %last_error,
                        "apply rejected, retrying"
                    );
                    tokio::time::sleep(ADMISSION_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(Error::apply_for(label, ADMISSION_MAX_ATTEMPTS, last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{MockControlPlane, QueryKind, ResourceQuery};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn descriptor() -> (ProbeTarget, PollSpec) {
        let probe = ProbeTarget {
            release: "ingress".to_string(),
            namespace: "ingress".to_string(),
            workload: Some(crate::probe::WorkloadRef {
                kind: QueryKind::Deployment,
                name: "ingress-controller".to_string(),
            }),
        };
        let wait = PollSpec::new(
            "ingress-ready",
            Duration::from_secs(10),
            Duration::from_millis(500),
        );
        (probe, wait)
    }

    fn release_apply() -> ResourceApply {
        ResourceApply::Release {
            name: "ingress".to_string(),
            chart: "ingress-nginx/ingress-nginx".to_string(),
            namespace: "ingress".to_string(),
            repo: None,
            version: None,
            values: vec![],
        }
    }

    fn healthy_answers(mock: &mut MockControlPlane) {
        mock.expect_query().returning(|q: &ResourceQuery| {
            if q.kind == QueryKind::Release {
                Ok(Some(json!({"info": {"status": "deployed"}})))
            } else {
                Ok(Some(json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 1}})))
            }
        });
    }

    #[tokio::test]
    async fn test_healthy_service_skipped_with_zero_applies() {
        let mut mock = MockControlPlane::new();
        healthy_answers(&mut mock);
        mock.expect_apply().times(0).returning(|_| Ok(()));

        let (probe, wait) = descriptor();
        let gate = DeploymentGate::new(Arc::new(mock));
        let descriptor =
            ServiceDescriptor::from_apply("ingress", "ingress", probe, release_apply(), wait);

        let (outcome, _elapsed) = gate.ensure(&descriptor).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_applied_and_confirmed() {
        let mut mock = MockControlPlane::new();
        // Release is absent until the apply lands, then converges healthy
        let queries = Arc::new(AtomicU32::new(0));
        let q = queries.clone();
        mock.expect_query().returning(move |query: &ResourceQuery| {
            let installed = q.load(Ordering::SeqCst) > 0;
            if !installed {
                return Ok(None);
            }
            if query.kind == QueryKind::Release {
                Ok(Some(json!({"info": {"status": "deployed"}})))
            } else {
                Ok(Some(json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 1}})))
            }
        });
        let q = queries.clone();
        mock.expect_apply().times(1).returning(move |_| {
            q.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (probe, wait) = descriptor();
        let gate = DeploymentGate::new(Arc::new(mock));
        let descriptor =
            ServiceDescriptor::from_apply("ingress", "ingress", probe, release_apply(), wait);

        let (outcome, _elapsed) = gate.ensure(&descriptor).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_converging_service_reports_failed() {
        let mut mock = MockControlPlane::new();
        mock.expect_query().returning(|q: &ResourceQuery| {
            if q.kind == QueryKind::Release {
                Ok(Some(json!({"info": {"status": "deployed"}})))
            } else {
                // Never becomes ready
                Ok(Some(json!({"spec": {"replicas": 1}, "status": {}})))
            }
        });
        mock.expect_apply().times(1).returning(|_| Ok(()));

        let (probe, _) = descriptor();
        let wait = PollSpec::new("short", Duration::from_secs(2), Duration::from_millis(500));
        let gate = DeploymentGate::new(Arc::new(mock));
        let descriptor =
            ServiceDescriptor::from_apply("ingress", "ingress", probe, release_apply(), wait);

        let (outcome, _elapsed) = gate.ensure(&descriptor).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_retry_absorbs_transient_rejections() {
        let mut mock = MockControlPlane::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        mock.expect_apply().times(3).returning(move |_| {
            if a.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::command(
                    "kubectl apply",
                    "webhook \"cert-manager.io\" unavailable",
                ))
            } else {
                Ok(())
            }
        });

        let apply = ResourceApply::Manifest {
            content: "apiVersion: cert-manager.io/v1\nkind: ClusterIssuer\nmetadata:\n  name: dev-ca\n"
                .to_string(),
        };
        apply_admission_gated(&mock, &apply).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_retry_exhaustion_surfaces_apply_error() {
        let mut mock = MockControlPlane::new();
        mock.expect_apply()
            .times(3)
            .returning(|_| Err(Error::command("kubectl apply", "webhook unavailable")));

        let apply = ResourceApply::Manifest {
            content: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: gated\n".to_string(),
        };
        let err = apply_admission_gated(&mock, &apply).await.unwrap_err();
        match err {
            Error::Apply { attempts, .. } => assert_eq!(attempts, ADMISSION_MAX_ATTEMPTS),
            other => panic!("expected Apply error, got {}", other),
        }
    }
}
