//! Environment configuration
//!
//! The whole environment is described by one YAML file with full built-in
//! defaults - `terrarium up` with no config brings up the stock stack.
//! Chart identities and values live here; manifest content beyond that is
//! the package manager's business.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::control_plane::QueryKind;
use crate::vault::SecretStoreConfig;
use crate::{Error, Result};

/// Workload kind backing a chart component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// A Deployment
    Deployment,
    /// A StatefulSet
    Statefulset,
}

impl WorkloadKind {
    /// The control-plane query kind for this workload
    pub fn query_kind(&self) -> QueryKind {
        match self {
            WorkloadKind::Deployment => QueryKind::Deployment,
            WorkloadKind::Statefulset => QueryKind::StatefulSet,
        }
    }
}

/// Workload readiness is probed from this object
#[derive(Debug, Clone, Deserialize)]
pub struct WorkloadSection {
    /// Deployment or StatefulSet
    pub kind: WorkloadKind,
    /// Object name
    pub name: String,
}

/// One chart-installed component
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChartComponent {
    /// Whether the component is brought up at all
    pub enabled: bool,
    /// Helm release name
    pub release: String,
    /// Chart reference
    pub chart: String,
    /// Chart repository URL
    pub repo: Option<String>,
    /// Chart version pin
    pub version: Option<String>,
    /// Target namespace
    pub namespace: String,
    /// Workload whose readiness defines health
    pub workload: Option<WorkloadSection>,
    /// `--set` overrides
    pub values: BTreeMap<String, String>,
    /// Convergence wait budget after apply
    pub wait_seconds: u64,
}

impl Default for ChartComponent {
    fn default() -> Self {
        Self {
            enabled: true,
            release: String::new(),
            chart: String::new(),
            repo: None,
            version: None,
            namespace: "default".to_string(),
            workload: None,
            values: BTreeMap::new(),
            wait_seconds: 180,
        }
    }
}

impl ChartComponent {
    fn new(
        release: &str,
        chart: &str,
        repo: &str,
        namespace: &str,
        workload: Option<(WorkloadKind, &str)>,
    ) -> Self {
        Self {
            release: release.to_string(),
            chart: chart.to_string(),
            repo: Some(repo.to_string()),
            namespace: namespace.to_string(),
            workload: workload.map(|(kind, name)| WorkloadSection {
                kind,
                name: name.to_string(),
            }),
            ..Self::default()
        }
    }

    /// The wait budget as a duration
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }
}

/// Secret-store component plus its lifecycle budgets
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecretStoreSection {
    /// Chart install settings
    pub component: ChartComponent,
    /// StatefulSet backing the store
    pub workload: String,
    /// Pod the lifecycle commands exec into
    pub pod: String,
    /// Container within the pod, if it has more than one
    pub container: Option<String>,
    /// PersistentVolumeClaims destroyed on credential-loss reset
    pub claims: Vec<String>,
    /// Budget for the store to answer its status probe
    pub probe_timeout_seconds: u64,
    /// Budget for an unseal to take effect
    pub unseal_timeout_seconds: u64,
    /// Budget for the health endpoint to answer
    pub ready_timeout_seconds: u64,
    /// Shared budget for the destructive reset
    pub reset_timeout_seconds: u64,
}

impl Default for SecretStoreSection {
    fn default() -> Self {
        Self {
            component: ChartComponent::new(
                "vault",
                "hashicorp/vault",
                "https://helm.releases.hashicorp.com",
                "vault",
                Some((WorkloadKind::Statefulset, "vault")),
            ),
            workload: "vault".to_string(),
            pod: "vault-0".to_string(),
            container: None,
            claims: vec!["data-vault-0".to_string()],
            probe_timeout_seconds: 120,
            unseal_timeout_seconds: 60,
            ready_timeout_seconds: 60,
            reset_timeout_seconds: 180,
        }
    }
}

impl SecretStoreSection {
    /// Lifecycle-controller settings derived from this section
    pub fn lifecycle_config(&self) -> SecretStoreConfig {
        SecretStoreConfig {
            namespace: self.component.namespace.clone(),
            release: self.component.release.clone(),
            workload: self.workload.clone(),
            pod: self.pod.clone(),
            container: self.container.clone(),
            backing_claims: self.claims.clone(),
            probe_timeout: Duration::from_secs(self.probe_timeout_seconds),
            unseal_timeout: Duration::from_secs(self.unseal_timeout_seconds),
            ready_timeout: Duration::from_secs(self.ready_timeout_seconds),
            reset_timeout: Duration::from_secs(self.reset_timeout_seconds),
            ..SecretStoreConfig::default()
        }
    }
}

/// Full environment description
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Kubeconfig override; None uses the ambient environment
    pub kubeconfig: Option<PathBuf>,
    /// Namespace holding the session marker
    pub session_namespace: String,
    /// Ingress controller
    pub ingress: ChartComponent,
    /// Certificate issuance (admission-gated)
    pub cert_manager: ChartComponent,
    /// Name of the self-signed ClusterIssuer written after cert-manager
    pub issuer_name: String,
    /// Secret store plus lifecycle budgets
    pub secret_store: SecretStoreSection,
    /// Observability stack
    pub monitoring: ChartComponent,
    /// Relational data store
    pub postgres: ChartComponent,
    /// Cache data store
    pub redis: ChartComponent,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let mut cert_manager = ChartComponent::new(
            "cert-manager",
            "jetstack/cert-manager",
            "https://charts.jetstack.io",
            "cert-manager",
            // The webhook is the readiness signal that gates issuer applies
            Some((WorkloadKind::Deployment, "cert-manager-webhook")),
        );
        cert_manager
            .values
            .insert("installCRDs".to_string(), "true".to_string());

        Self {
            kubeconfig: None,
            session_namespace: "default".to_string(),
            ingress: ChartComponent::new(
                "ingress-nginx",
                "ingress-nginx/ingress-nginx",
                "https://kubernetes.github.io/ingress-nginx",
                "ingress-nginx",
                Some((WorkloadKind::Deployment, "ingress-nginx-controller")),
            ),
            cert_manager,
            issuer_name: "dev-selfsigned".to_string(),
            secret_store: SecretStoreSection::default(),
            monitoring: ChartComponent::new(
                "monitoring",
                "prometheus-community/kube-prometheus-stack",
                "https://prometheus-community.github.io/helm-charts",
                "monitoring",
                Some((WorkloadKind::Deployment, "monitoring-kube-prometheus-operator")),
            ),
            postgres: ChartComponent::new(
                "postgres",
                "bitnami/postgresql",
                "https://charts.bitnami.com/bitnami",
                "data",
                Some((WorkloadKind::Statefulset, "postgres-postgresql")),
            ),
            redis: ChartComponent::new(
                "redis",
                "bitnami/redis",
                "https://charts.bitnami.com/bitnami",
                "data",
                Some((WorkloadKind::Statefulset, "redis-master")),
            ),
        }
    }
}

impl EnvironmentConfig {
    /// Load configuration from a YAML file, filling unset fields with
    /// defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }
}
