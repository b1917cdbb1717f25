//! Environment orchestrator
//!
//! Sequences the bring-up of the whole local environment through the
//! deployment gate and the secret-store lifecycle:
//!
//! 1. Ingress controller
//! 2. Certificate issuance (cert-manager, then the admission-gated issuer)
//! 3. Secret store install + initialize/unseal
//! 4. Observability stack
//! 5. Data stores
//!
//! Ordering matters - anything needing TLS comes after issuance, anything
//! needing secrets after the store is unsealed - but each step is
//! individually idempotent, so a partial previous run converges instead of
//! erroring. Core infrastructure failures abort; observability and data
//! stores degrade (log and continue). An external interrupt stops between
//! steps and removes the session marker but rolls nothing back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ChartComponent, EnvironmentConfig};
use crate::control_plane::{ControlPlane, QueryKind, ResourceApply};
use crate::gate::{self, DeploymentGate, EnsureOutcome, ServiceDescriptor};
use crate::health::HealthState;
use crate::poll::PollSpec;
use crate::probe::{ProbeTarget, WorkloadRef};
use crate::registry::TimingRegistry;
use crate::status::StatusTicker;
use crate::vault::{LifecycleController, StoreState};
use crate::{Error, Result};

/// Name of the transient session marker ConfigMap
pub const SESSION_MARKER_NAME: &str = "terrarium-session";

/// Interval between probe evaluations while waiting for convergence
const CONVERGE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Period of the background progress ticker
const TICK_PERIOD: Duration = Duration::from_secs(15);

/// Build a gate descriptor from a chart component
fn descriptor(component: &ChartComponent) -> ServiceDescriptor {
    let probe = ProbeTarget {
        release: component.release.clone(),
        namespace: component.namespace.clone(),
        workload: component.workload.as_ref().map(|w| WorkloadRef {
            kind: w.kind.query_kind(),
            name: w.name.clone(),
        }),
    };
    let apply = ResourceApply::Release {
        name: component.release.clone(),
        chart: component.chart.clone(),
        namespace: component.namespace.clone(),
        repo: component.repo.clone(),
        version: component.version.clone(),
        values: component
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    let wait = PollSpec::new(
        format!("{}-ready", component.release),
        component.wait(),
        CONVERGE_POLL_INTERVAL,
    );
    ServiceDescriptor::from_apply(
        component.release.clone(),
        component.namespace.clone(),
        probe,
        apply,
        wait,
    )
}

/// The composing orchestrator for one environment
pub struct Environment {
    config: EnvironmentConfig,
    control_plane: Arc<dyn ControlPlane>,
    gate: DeploymentGate,
    lifecycle: LifecycleController,
}

impl Environment {
    /// Create an environment over the given control plane
    pub fn new(config: EnvironmentConfig, control_plane: Arc<dyn ControlPlane>) -> Self {
        let gate = DeploymentGate::new(control_plane.clone());
        let lifecycle = LifecycleController::new(
            control_plane.clone(),
            config.secret_store.lifecycle_config(),
        );
        Self {
            config,
            control_plane,
            gate,
            lifecycle,
        }
    }

    /// Converge the environment toward its configured state.
    ///
    /// Idempotent: already-healthy services are skipped, and a rerun after
    /// any partial state picks up where things stand. Returns the step
    /// records for the summary.
    pub async fn converge(&self, cancel: &CancellationToken) -> Result<TimingRegistry> {
        let mut registry = TimingRegistry::new();

        self.create_session_marker().await?;
        let result = self.converge_inner(cancel, &mut registry).await;
        // The marker goes away whether we finished or were interrupted;
        // applied resources stay wherever they were reached.
        if let Err(e) = self.remove_session_marker().await {
            warn!(error = %e, "failed to remove session marker");
        }

        result.map(|()| registry)
    }

    async fn converge_inner(
        &self,
        cancel: &CancellationToken,
        registry: &mut TimingRegistry,
    ) -> Result<()> {
        println!("=== Converging environment ===\n");

        if self.config.ingress.enabled {
            self.check_interrupt(cancel)?;
            println!("[Phase 1] Ingress controller...");
            self.ensure_component(&self.config.ingress, true, registry)
                .await?;
        }

        if self.config.cert_manager.enabled {
            self.check_interrupt(cancel)?;
            println!("[Phase 2] Certificate issuance...");
            self.ensure_component(&self.config.cert_manager, true, registry)
                .await?;
            self.ensure_issuer(registry).await?;
        }

        if self.config.secret_store.component.enabled {
            self.check_interrupt(cancel)?;
            println!("[Phase 3] Secret store...");
            self.ensure_component(&self.config.secret_store.component, true, registry)
                .await?;
            self.ensure_store_ready(registry).await?;
        }

        if self.config.monitoring.enabled {
            self.check_interrupt(cancel)?;
            println!("[Phase 4] Observability stack...");
            self.ensure_component(&self.config.monitoring, false, registry)
                .await?;
        }

        if self.config.postgres.enabled || self.config.redis.enabled {
            self.check_interrupt(cancel)?;
            println!("[Phase 5] Data stores...");
            if self.config.postgres.enabled {
                self.ensure_component(&self.config.postgres, false, registry)
                    .await?;
            }
            if self.config.redis.enabled {
                self.ensure_component(&self.config.redis, false, registry)
                    .await?;
            }
        }

        println!("\n=== Converge complete ===\n{}", registry.summary());
        Ok(())
    }

    fn check_interrupt(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            info!("interrupt received, stopping between steps");
            return Err(Error::internal_with_context("converge", "interrupted"));
        }
        Ok(())
    }

    /// Run one component through the gate under a progress ticker.
    ///
    /// `required` steps abort the converge on failure; optional ones
    /// degrade: the failure is recorded and logged, and the flow continues.
    async fn ensure_component(
        &self,
        component: &ChartComponent,
        required: bool,
        registry: &mut TimingRegistry,
    ) -> Result<()> {
        let descriptor = descriptor(component);
        let start = tokio::time::Instant::now();

        let ticker = StatusTicker::start(descriptor.name.clone(), TICK_PERIOD);
        let result = self.gate.ensure(&descriptor).await;
        // Stopped before any outcome is reported
        ticker.stop().await;

        match result {
            Ok((outcome, elapsed)) => {
                println!("  {}: {} ({:.1}s)", descriptor.name, outcome, elapsed.as_secs_f64());
                registry.record(&descriptor.name, outcome, elapsed);
                if outcome == EnsureOutcome::Failed {
                    if required {
                        return Err(Error::internal_with_context(
                            "converge",
                            format!("{} did not converge", descriptor.name),
                        ));
                    }
                    warn!(service = %descriptor.name, "optional component failed, continuing");
                }
                Ok(())
            }
            Err(e) => {
                registry.record(&descriptor.name, EnsureOutcome::Failed, start.elapsed());
                if required {
                    return Err(e);
                }
                warn!(service = %descriptor.name, error = %e, "optional component errored, continuing");
                Ok(())
            }
        }
    }

    /// Write the self-signed ClusterIssuer once cert-manager serves.
    ///
    /// The gate's wait on the webhook workload is the readiness predicate;
    /// the bounded fixed-delay retry remains as the backstop for admission
    /// propagation races.
    async fn ensure_issuer(&self, registry: &mut TimingRegistry) -> Result<()> {
        let start = tokio::time::Instant::now();
        let manifest = format!(
            "apiVersion: cert-manager.io/v1\nkind: ClusterIssuer\nmetadata:\n  name: {}\nspec:\n  selfSigned: {{}}\n",
            self.config.issuer_name
        );
        let apply = ResourceApply::Manifest { content: manifest };

        let ticker = StatusTicker::start("cluster-issuer", TICK_PERIOD);
        let result = gate::apply_admission_gated(self.control_plane.as_ref(), &apply).await;
        ticker.stop().await;

        match result {
            Ok(()) => {
                println!("  cluster-issuer: applied ({:.1}s)", start.elapsed().as_secs_f64());
                registry.record("cluster-issuer", EnsureOutcome::Applied, start.elapsed());
                Ok(())
            }
            Err(e) => {
                registry.record("cluster-issuer", EnsureOutcome::Failed, start.elapsed());
                Err(e)
            }
        }
    }

    /// Drive the secret store to ready and record the step
    async fn ensure_store_ready(&self, registry: &mut TimingRegistry) -> Result<()> {
        let start = tokio::time::Instant::now();

        let ticker = StatusTicker::start("vault-unseal", TICK_PERIOD);
        let result = self.lifecycle.ensure_ready().await;
        ticker.stop().await;

        match result {
            Ok(credential) => {
                println!("  vault-unseal: ready ({:.1}s)", start.elapsed().as_secs_f64());
                registry.record("vault-unseal", EnsureOutcome::Applied, start.elapsed());
                info!(issued_at = %credential.issued_at, "secret store ready");
                Ok(())
            }
            Err(e) => {
                registry.record("vault-unseal", EnsureOutcome::Failed, start.elapsed());
                Err(e)
            }
        }
    }

    /// Live health of every enabled component plus the store lifecycle state
    pub async fn status(&self) -> Result<Vec<(String, String)>> {
        let mut rows = Vec::new();
        for component in self.components() {
            if !component.enabled {
                continue;
            }
            let descriptor = descriptor(component);
            let health: HealthState = self.gate.health(&descriptor).await;
            rows.push((component.release.clone(), health.to_string()));
        }
        let store: StoreState = self.lifecycle.state().await?;
        rows.push(("vault lifecycle".to_string(), store.to_string()));
        Ok(rows)
    }

    fn components(&self) -> [&ChartComponent; 6] {
        [
            &self.config.ingress,
            &self.config.cert_manager,
            &self.config.secret_store.component,
            &self.config.monitoring,
            &self.config.postgres,
            &self.config.redis,
        ]
    }

    /// Destroy and reinitialize the secret store, then bring it back to
    /// ready. Destructive; the CLI gates this behind explicit confirmation.
    pub async fn reset_secret_store(&self) -> Result<()> {
        self.lifecycle.reset_and_reinitialize().await?;
        self.lifecycle.ensure_ready().await?;
        Ok(())
    }

    async fn create_session_marker(&self) -> Result<()> {
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": SESSION_MARKER_NAME,
                "namespace": self.config.session_namespace,
            },
            "data": {
                "started_at": Utc::now().to_rfc3339(),
            }
        });
        let content = serde_json::to_string(&manifest)
            .map_err(|e| Error::serialization(format!("session marker: {}", e)))?;
        self.control_plane
            .apply(&ResourceApply::Manifest { content })
            .await
    }

    async fn remove_session_marker(&self) -> Result<()> {
        self.control_plane
            .delete(
                QueryKind::ConfigMap,
                SESSION_MARKER_NAME,
                &self.config.session_namespace,
            )
            .await
    }
}
