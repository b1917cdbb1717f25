//! Control-plane collaborator interface
//!
//! The rest of the crate talks to the cluster through the narrow
//! [`ControlPlane`] trait: read-only queries, idempotent applies, deletes,
//! and in-pod exec with optional piped stdin. The production implementation
//! shells out to `kubectl` and `helm` - the control plane and package
//! manager are invoked, not reimplemented.
//!
//! All mutating operations have upsert semantics and are safe to re-issue;
//! retries and idempotent re-entry are the only concurrency-safety mechanism
//! (single reconciling actor per environment).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Timeout for a single kubectl/helm invocation
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Resource kinds the probe layer queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// A Helm release (queried via `helm status`)
    Release,
    /// A Deployment workload
    Deployment,
    /// A StatefulSet workload
    StatefulSet,
    /// A core Secret
    Secret,
    /// A core ConfigMap
    ConfigMap,
    /// A single Pod
    Pod,
    /// A PersistentVolumeClaim (destroyed by the secret-store reset path)
    PersistentVolumeClaim,
}

impl QueryKind {
    /// kubectl resource name; `None` for releases, which go through helm
    fn resource(&self) -> Option<&'static str> {
        match self {
            QueryKind::Release => None,
            QueryKind::Deployment => Some("deployment"),
            QueryKind::StatefulSet => Some("statefulset"),
            QueryKind::Secret => Some("secret"),
            QueryKind::ConfigMap => Some("configmap"),
            QueryKind::Pod => Some("pod"),
            QueryKind::PersistentVolumeClaim => Some("persistentvolumeclaim"),
        }
    }
}

/// A read-only structured query against the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuery {
    /// What kind of object to read
    pub kind: QueryKind,
    /// Namespace to read from
    pub namespace: String,
    /// Object or release name
    pub name: String,
}

impl ResourceQuery {
    /// Query a Helm release's status document
    pub fn release(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Release,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Query an arbitrary namespaced object
    pub fn object(
        kind: QueryKind,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// An idempotent mutating action against the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceApply {
    /// Apply a raw manifest. The content is piped to `kubectl apply -f -`
    /// via stdin and never appears in an argument list.
    Manifest {
        /// Multi-document YAML or single-document JSON
        content: String,
    },
    /// Upsert a Helm release (`helm upgrade --install`)
    Release {
        /// Release name
        name: String,
        /// Chart reference (e.g. "ingress-nginx/ingress-nginx")
        chart: String,
        /// Target namespace (created if missing)
        namespace: String,
        /// Chart repository URL, if not locally configured
        repo: Option<String>,
        /// Chart version pin
        version: Option<String>,
        /// `--set` key=value overrides
        values: Vec<(String, String)>,
    },
}

impl ResourceApply {
    /// Short label for logs and apply errors
    pub fn label(&self) -> String {
        match self {
            ResourceApply::Manifest { content } => content
                .lines()
                .find_map(|l| l.strip_prefix("  name: "))
                .unwrap_or("manifest")
                .to_string(),
            ResourceApply::Release { name, .. } => name.clone(),
        }
    }
}

/// Where an exec runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    /// Pod name
    pub pod: String,
    /// Pod namespace
    pub namespace: String,
    /// Container name, if the pod has more than one
    pub container: Option<String>,
}

/// Result of an exec invocation
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Remote command exit code (kubectl propagates it)
    pub code: i32,
}

impl ExecOutput {
    /// Whether the remote command exited zero
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Narrow collaborator trait for the cluster control plane and package manager
///
/// `query` returns `Ok(None)` when the target does not exist and `Err` only
/// when the control plane itself is unreachable or answers garbage - the
/// probe layer turns that into a safe default snapshot. `exec` returns
/// `Ok` with a nonzero [`ExecOutput::code`] when the *remote* command fails;
/// only a failure to reach the pod at all is an `Err`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Read one object or release as structured JSON
    async fn query(&self, query: &ResourceQuery) -> Result<Option<Value>>;

    /// Idempotent upsert of a manifest or release
    async fn apply(&self, apply: &ResourceApply) -> Result<()>;

    /// Ensure an object is absent. Used only by the destructive reset path.
    async fn delete(&self, kind: QueryKind, name: &str, namespace: &str) -> Result<()>;

    /// Run a command inside a pod, optionally piping `stdin` to it.
    ///
    /// The stdin channel is reserved for secret transfer: content passed
    /// here never appears in a host-visible process argument list.
    async fn exec<'a>(
        &self,
        target: &ExecTarget,
        command: &[String],
        stdin: Option<&'a str>,
    ) -> Result<ExecOutput>;
}

/// Production [`ControlPlane`] that invokes `kubectl` and `helm`
#[derive(Debug, Clone, Default)]
pub struct ShellControlPlane {
    /// Kubeconfig override; None uses the ambient environment
    kubeconfig: Option<PathBuf>,
}

impl ShellControlPlane {
    /// Create a control plane using the ambient kubeconfig
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a control plane pinned to a kubeconfig file
    pub fn with_kubeconfig(path: PathBuf) -> Self {
        Self {
            kubeconfig: Some(path),
        }
    }

    /// Spawn a command, optionally piping stdin, and capture its output
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<ExecOutput> {
        let label = command_label(program, args);
        trace!(command = %label, "running");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = &self.kubeconfig {
            cmd.env("KUBECONFIG", path);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::command(&label, format!("spawn failed: {}", e)))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                use tokio::io::AsyncWriteExt;
                pipe.write_all(input.as_bytes()).await?;
                // pipe drops here, closing the child's stdin
            }
        }

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::command(&label, format!("timed out after {:?}", COMMAND_TIMEOUT)))??;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Short command label for logging and errors (program + subcommand)
fn command_label(program: &str, args: &[String]) -> String {
    match args.first() {
        Some(sub) => format!("{} {}", program, sub),
        None => program.to_string(),
    }
}

/// Whether helm stderr indicates the release simply does not exist
fn helm_release_absent(stderr: &str) -> bool {
    stderr.contains("release: not found")
}

/// Build the argv for a helm release upsert
fn release_args(
    name: &str,
    chart: &str,
    namespace: &str,
    repo: Option<&str>,
    version: Option<&str>,
    values: &[(String, String)],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "upgrade".into(),
        "--install".into(),
        name.into(),
        chart.into(),
        "-n".into(),
        namespace.into(),
        "--create-namespace".into(),
    ];
    if let Some(repo) = repo {
        args.push("--repo".into());
        args.push(repo.into());
    }
    if let Some(version) = version {
        args.push("--version".into());
        args.push(version.into());
    }
    for (key, value) in values {
        args.push("--set".into());
        args.push(format!("{}={}", key, value));
    }
    args
}

#[async_trait]
impl ControlPlane for ShellControlPlane {
    async fn query(&self, query: &ResourceQuery) -> Result<Option<Value>> {
        let output = match query.kind {
            QueryKind::Release => {
                let args: Vec<String> = vec![
                    "status".into(),
                    query.name.clone(),
                    "-n".into(),
                    query.namespace.clone(),
                    "-o".into(),
                    "json".into(),
                ];
                let out = self.run("helm", &args, None).await?;
                if !out.success() {
                    if helm_release_absent(&out.stderr) {
                        return Ok(None);
                    }
                    return Err(Error::command("helm status", out.stderr.trim().to_string()));
                }
                out
            }
            kind => {
                let resource = kind
                    .resource()
                    .ok_or_else(|| Error::internal_with_context("query", "release kind reached kubectl path"))?;
                let args: Vec<String> = vec![
                    "get".into(),
                    resource.into(),
                    query.name.clone(),
                    "-n".into(),
                    query.namespace.clone(),
                    "-o".into(),
                    "json".into(),
                    "--ignore-not-found".into(),
                ];
                let out = self.run("kubectl", &args, None).await?;
                if !out.success() {
                    return Err(Error::command("kubectl get", out.stderr.trim().to_string()));
                }
                if out.stdout.trim().is_empty() {
                    return Ok(None);
                }
                out
            }
        };

        serde_json::from_str(&output.stdout)
            .map(Some)
            .map_err(|e| Error::serialization(format!("bad JSON from query: {}", e)))
    }

    async fn apply(&self, apply: &ResourceApply) -> Result<()> {
        match apply {
            ResourceApply::Manifest { content } => {
                let args: Vec<String> = vec!["apply".into(), "-f".into(), "-".into()];
                let out = self.run("kubectl", &args, Some(content)).await?;
                if !out.success() {
                    return Err(Error::command(
                        "kubectl apply",
                        out.stderr.trim().to_string(),
                    ));
                }
                debug!(resource = %apply.label(), "manifest applied");
                Ok(())
            }
            ResourceApply::Release {
                name,
                chart,
                namespace,
                repo,
                version,
                values,
            } => {
                let args = release_args(
                    name,
                    chart,
                    namespace,
                    repo.as_deref(),
                    version.as_deref(),
                    values,
                );
                let out = self.run("helm", &args, None).await?;
                if !out.success() {
                    return Err(Error::command(
                        "helm upgrade",
                        out.stderr.trim().to_string(),
                    ));
                }
                debug!(release = %name, chart = %chart, "release upserted");
                Ok(())
            }
        }
    }

    async fn delete(&self, kind: QueryKind, name: &str, namespace: &str) -> Result<()> {
        match kind.resource() {
            None => {
                // Releases are torn down through helm
                let args: Vec<String> = vec![
                    "uninstall".into(),
                    name.into(),
                    "-n".into(),
                    namespace.into(),
                ];
                let out = self.run("helm", &args, None).await?;
                if !out.success() && !helm_release_absent(&out.stderr) {
                    return Err(Error::command(
                        "helm uninstall",
                        out.stderr.trim().to_string(),
                    ));
                }
                Ok(())
            }
            Some(resource) => {
                let args: Vec<String> = vec![
                    "delete".into(),
                    resource.into(),
                    name.into(),
                    "-n".into(),
                    namespace.into(),
                    "--ignore-not-found".into(),
                    "--wait=false".into(),
                ];
                let out = self.run("kubectl", &args, None).await?;
                if !out.success() {
                    return Err(Error::command(
                        "kubectl delete",
                        out.stderr.trim().to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    async fn exec<'a>(
        &self,
        target: &ExecTarget,
        command: &[String],
        stdin: Option<&'a str>,
    ) -> Result<ExecOutput> {
        let mut args: Vec<String> = vec!["exec".into()];
        if stdin.is_some() {
            args.push("-i".into());
        }
        args.push("-n".into());
        args.push(target.namespace.clone());
        args.push(target.pod.clone());
        if let Some(container) = &target.container {
            args.push("-c".into());
            args.push(container.clone());
        }
        args.push("--".into());
        args.extend(command.iter().cloned());

        // Nonzero exit codes flow back to the caller; only spawn/transport
        // failures surface as Err.
        self.run("kubectl", &args, stdin).await
    }
}
