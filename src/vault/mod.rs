//! Secret-store lifecycle
//!
//! Drives the store through initialize / unseal / reset to its one stable
//! state, `Ready`, converging from whatever partial state a previous run
//! left behind. The flow is:
//!
//! 1. Probe: `Unknown` resolves to `Uninitialized`, `Sealed`, or `Ready`.
//! 2. `Uninitialized`: initialize (1 share, threshold 1), persist the
//!    credential, then unseal. The credential is durably persisted *before*
//!    it is used, so a crash between persistence and use re-enters the
//!    sealed-with-key branch on retry.
//! 3. `Sealed` with a stored key: unseal and wait.
//! 4. `Sealed`, initialized, no stored key: `LostKey` - destroy the backing
//!    storage and reinitialize. Destructive and irreversible by design.
//! 5. `Ready`: verify the health endpoint answers, falling back to a
//!    structural readiness check before conceding failure.

pub mod credential;

pub use credential::{Credential, CredentialStore, CREDENTIAL_SECRET_NAME};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::control_plane::{ControlPlane, ExecTarget, QueryKind};
use crate::poll::{self, PollPhase, PollSpec};
use crate::probe::{ProbeClient, ProbeTarget, StoreStatus, WorkloadRef};
use crate::{Error, Result};

/// Lifecycle state of the secret store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Not yet probed, or the store is unreachable
    Unknown,
    /// Reachable but never initialized
    Uninitialized,
    /// Initialized with data encrypted at rest
    Sealed,
    /// Transient: unseal submitted, waiting for the store to open
    Unsealing,
    /// Initialized, unsealed, serving
    Ready,
    /// Initialized and sealed but the stored unseal key is gone
    LostKey,
}

impl StoreState {
    /// Derive the state a probed status document implies.
    ///
    /// `LostKey` cannot be derived from the status alone; see
    /// [`LifecycleController::state`].
    pub fn from_status(status: &StoreStatus) -> Self {
        if !status.reachable {
            return StoreState::Unknown;
        }
        if !status.initialized {
            return StoreState::Uninitialized;
        }
        if status.sealed {
            return StoreState::Sealed;
        }
        StoreState::Ready
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreState::Unknown => "unknown",
            StoreState::Uninitialized => "uninitialized",
            StoreState::Sealed => "sealed",
            StoreState::Unsealing => "unsealing",
            StoreState::Ready => "ready",
            StoreState::LostKey => "lost-key",
        };
        f.write_str(s)
    }
}

/// Where the secret store runs and how long its transitions may take
#[derive(Debug, Clone)]
pub struct SecretStoreConfig {
    /// Namespace holding the store
    pub namespace: String,
    /// Helm release name
    pub release: String,
    /// StatefulSet backing the store
    pub workload: String,
    /// Pod the lifecycle commands exec into
    pub pod: String,
    /// Container within the pod, if it has more than one
    pub container: Option<String>,
    /// PersistentVolumeClaims destroyed by the reset path
    pub backing_claims: Vec<String>,
    /// Budget for the store to answer its status probe at all
    pub probe_timeout: Duration,
    /// Budget for an unseal to take effect
    pub unseal_timeout: Duration,
    /// Budget for the health endpoint to answer once unsealed
    pub ready_timeout: Duration,
    /// Shared budget for the destructive reset (pod back + uninitialized)
    pub reset_timeout: Duration,
    /// Interval for fast transitions (seal state, pod phase)
    pub fast_interval: Duration,
    /// Interval for slow convergence (reachability after scheduling)
    pub slow_interval: Duration,
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "vault".to_string(),
            release: "vault".to_string(),
            workload: "vault".to_string(),
            pod: "vault-0".to_string(),
            container: None,
            backing_claims: vec!["data-vault-0".to_string()],
            probe_timeout: Duration::from_secs(120),
            unseal_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(180),
            fast_interval: Duration::from_millis(500),
            slow_interval: Duration::from_secs(3),
        }
    }
}

/// The secret-store state machine
pub struct LifecycleController {
    control_plane: Arc<dyn ControlPlane>,
    probe: ProbeClient,
    credentials: CredentialStore,
    config: SecretStoreConfig,
}

impl LifecycleController {
    /// Create a controller for the configured store
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: SecretStoreConfig) -> Self {
        let probe = ProbeClient::new(control_plane.clone());
        let credentials = CredentialStore::new(control_plane.clone(), config.namespace.clone());
        Self {
            control_plane,
            probe,
            credentials,
            config,
        }
    }

    fn exec_target(&self) -> ExecTarget {
        ExecTarget {
            pod: self.config.pod.clone(),
            namespace: self.config.namespace.clone(),
            container: self.config.container.clone(),
        }
    }

    fn probe_target(&self) -> ProbeTarget {
        ProbeTarget {
            release: self.config.release.clone(),
            namespace: self.config.namespace.clone(),
            workload: Some(WorkloadRef {
                kind: QueryKind::StatefulSet,
                name: self.config.workload.clone(),
            }),
        }
    }

    /// Current lifecycle state, including lost-key detection
    pub async fn state(&self) -> Result<StoreState> {
        let status = self.probe.secret_store_status(&self.exec_target()).await;
        let state = StoreState::from_status(&status);
        if state == StoreState::Sealed && self.credentials.load().await?.is_none() {
            return Ok(StoreState::LostKey);
        }
        Ok(state)
    }

    /// Drive the store to `Ready` and return its credential.
    ///
    /// Idempotent: on an already-`Ready` store this issues zero mutating
    /// calls. Every branch converges to `Ready` or surfaces an error.
    pub async fn ensure_ready(&self) -> Result<Credential> {
        let target = self.exec_target();

        // The store must answer its status probe before anything else;
        // an unreachable store is waited out, never initialized blind.
        let reachable_spec = PollSpec::new(
            "secret-store-reachable",
            self.config.probe_timeout,
            self.config.slow_interval,
        );
        let probe = &self.probe;
        let target_ref = &target;
        let outcome = poll::wait(&reachable_spec, || async move {
            probe.secret_store_status(target_ref).await.reachable
        })
        .await;
        if !outcome.is_ready() {
            return Err(Error::timeout("secret-store-reachable", outcome.elapsed()));
        }

        let status = self.probe.secret_store_status(&target).await;
        match StoreState::from_status(&status) {
            StoreState::Ready => {
                info!("secret store already unsealed");
                let credential = self.credentials.load().await?.ok_or_else(|| {
                    Error::internal_with_context(
                        "lifecycle",
                        "store is unsealed but no stored credential exists",
                    )
                })?;
                self.confirm_serving().await?;
                Ok(credential)
            }
            StoreState::Uninitialized => {
                let credential = self.initialize().await?;
                self.unseal(&credential).await?;
                self.confirm_serving().await?;
                Ok(credential)
            }
            StoreState::Sealed => match self.credentials.load().await? {
                Some(credential) => {
                    info!("sealed store with stored key, unsealing");
                    self.unseal(&credential).await?;
                    self.confirm_serving().await?;
                    Ok(credential)
                }
                None => {
                    warn!("initialized store is sealed with no stored key, entering reset");
                    let credential = self.reset_and_reinitialize().await?;
                    self.unseal(&credential).await?;
                    self.confirm_serving().await?;
                    Ok(credential)
                }
            },
            state => Err(Error::internal_with_context(
                "lifecycle",
                format!("unexpected store state after probe: {}", state),
            )),
        }
    }

    /// Initialize the store and persist the resulting credential.
    ///
    /// Guarded: probed first, so initializing an already-initialized store
    /// is a no-op that returns the stored credential. Ends in
    /// sealed-with-key; a parse failure is fatal for this call and persists
    /// nothing.
    async fn initialize(&self) -> Result<Credential> {
        let target = self.exec_target();

        let status = self.probe.secret_store_status(&target).await;
        if status.initialized {
            debug!("store already initialized, skipping initialize");
            return match self.credentials.load().await? {
                Some(credential) => Ok(credential),
                None => Err(Error::internal_with_context(
                    "lifecycle",
                    "store initialized out of band without a stored credential",
                )),
            };
        }

        info!("initializing secret store (1 share, threshold 1)");
        let command: Vec<String> = [
            "vault",
            "operator",
            "init",
            "-key-shares=1",
            "-key-threshold=1",
            "-format=json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let output = self.control_plane.exec(&target, &command, None).await?;
        if !output.success() {
            return Err(Error::command(
                "vault operator init",
                output.stderr.trim().to_string(),
            ));
        }

        let credential = Credential::from_init_output(&output.stdout).map_err(|e| {
            error!(error = %e, "initialize response could not be decoded; nothing persisted");
            e
        })?;

        // Persist before the key is ever used: a crash here leaves a
        // sealed store with a recoverable stored key.
        self.credentials.persist(&credential).await?;
        Ok(credential)
    }

    /// Unseal with the given credential and wait until the store opens
    async fn unseal(&self, credential: &Credential) -> Result<()> {
        let target = self.exec_target();

        info!(state = %StoreState::Unsealing, "submitting unseal key");
        // The key travels over stdin; it never appears in an argument list.
        let command: Vec<String> = ["vault", "operator", "unseal", "-"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let piped = Zeroizing::new(format!("{}\n", credential.unseal_key.as_str()));
        let output = self
            .control_plane
            .exec(&target, &command, Some(piped.as_str()))
            .await?;
        if !output.success() {
            return Err(Error::command(
                "vault operator unseal",
                output.stderr.trim().to_string(),
            ));
        }

        let spec = PollSpec::new(
            "secret-store-unsealed",
            self.config.unseal_timeout,
            self.config.fast_interval,
        );
        let probe = &self.probe;
        let target_ref = &target;
        let outcome = poll::wait(&spec, || async move {
            let status = probe.secret_store_status(target_ref).await;
            status.reachable && !status.sealed
        })
        .await;
        if !outcome.is_ready() {
            return Err(Error::timeout("secret-store-unsealed", outcome.elapsed()));
        }
        info!(elapsed = ?outcome.elapsed(), "secret store unsealed");
        Ok(())
    }

    /// Verify the store actually serves.
    ///
    /// Waits on the in-pod health endpoint returning 200; if that times
    /// out, falls back to the structural readiness check before conceding
    /// failure.
    async fn confirm_serving(&self) -> Result<()> {
        let target = self.exec_target();
        let spec = PollSpec::new(
            "secret-store-health",
            self.config.ready_timeout,
            self.config.fast_interval,
        );
        let cp = &self.control_plane;
        let target_ref = &target;
        let outcome = poll::wait(&spec, || async move {
            let command: Vec<String> = [
                "wget",
                "-q",
                "-O",
                "-",
                "http://127.0.0.1:8200/v1/sys/health",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect();
            matches!(cp.exec(target_ref, &command, None).await, Ok(out) if out.success())
        })
        .await;
        if outcome.is_ready() {
            return Ok(());
        }

        warn!("health endpoint did not answer, checking structural readiness");
        let snapshot = self.probe.query(&self.probe_target()).await;
        if snapshot.total > 0 && snapshot.ready == snapshot.total {
            return Ok(());
        }
        Err(Error::timeout("secret-store-health", outcome.elapsed()))
    }

    /// Destroy the store's backing storage and reinitialize.
    ///
    /// This is the designed recovery from a dev-only credential loss:
    /// irreversible, and safe only because the backing storage is
    /// ephemeral. A persistent storage backend would need an explicit
    /// confirmation gate before this transition. Ends in sealed-with-key
    /// with a freshly issued credential.
    pub async fn reset_and_reinitialize(&self) -> Result<Credential> {
        warn!(
            pod = %self.config.pod,
            claims = ?self.config.backing_claims,
            "destroying secret store backing storage; all stored data will be lost"
        );

        for claim in &self.config.backing_claims {
            self.control_plane
                .delete(QueryKind::PersistentVolumeClaim, claim, &self.config.namespace)
                .await
                .map_err(|e| Error::reset(format!("deleting claim {}: {}", claim, e)))?;
        }
        // Deleting the pod lets its controller recreate it on fresh storage
        self.control_plane
            .delete(QueryKind::Pod, &self.config.pod, &self.config.namespace)
            .await
            .map_err(|e| Error::reset(format!("deleting pod {}: {}", self.config.pod, e)))?;

        // One budget across both recovery phases: the pod answering its
        // status probe again, then reporting uninitialized.
        let probe = self.probe.clone();
        let target = self.exec_target();
        let reachable_probe = probe.clone();
        let reachable_target = target.clone();
        let phases = vec![
            PollPhase::new("store-reachable", self.config.slow_interval, move || {
                let probe = reachable_probe.clone();
                let target = reachable_target.clone();
                Box::pin(async move { probe.secret_store_status(&target).await.reachable })
            }),
            PollPhase::new("store-uninitialized", self.config.fast_interval, move || {
                let probe = probe.clone();
                let target = target.clone();
                Box::pin(async move {
                    let status = probe.secret_store_status(&target).await;
                    status.reachable && !status.initialized
                })
            }),
        ];
        let outcome = poll::wait_phases(self.config.reset_timeout, phases).await;
        if !outcome.is_ready() {
            return Err(Error::reset(format!(
                "store did not return to uninitialized within {:?}",
                self.config.reset_timeout
            )));
        }

        info!("backing storage destroyed, reinitializing");
        self.initialize().await
    }
}
