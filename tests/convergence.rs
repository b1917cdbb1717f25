//! Cross-component convergence scenarios against an in-memory fake cluster.
//!
//! The fake control plane simulates just enough cluster behavior for the
//! full flows: helm releases flip to deployed-and-ready on apply, the vault
//! pod answers status/init/unseal execs with real state transitions, and
//! Secret/ConfigMap manifests round-trip through apply and query.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use terrarium::config::EnvironmentConfig;
use terrarium::control_plane::{
    ControlPlane, ExecOutput, ExecTarget, QueryKind, ResourceApply, ResourceQuery,
};
use terrarium::environment::{Environment, SESSION_MARKER_NAME};
use terrarium::gate::EnsureOutcome;
use terrarium::Error;

#[derive(Debug, Default)]
struct VaultSim {
    initialized: bool,
    sealed: bool,
    unseal_key: Option<String>,
    issued: u32,
}

#[derive(Default)]
struct FakeCluster {
    /// Installed (namespace, release) pairs
    releases: Mutex<HashSet<(String, String)>>,
    /// Stored Secrets by (namespace, name) -> data map (base64 values)
    secrets: Mutex<HashMap<(String, String), HashMap<String, String>>>,
    /// Session markers present
    markers: Mutex<HashSet<String>>,
    vault: Mutex<VaultSim>,
    release_applies: AtomicU32,
    init_calls: AtomicU32,
    /// argv of the last unseal exec, to prove the key was not in it
    last_unseal_argv: Mutex<Vec<String>>,
}

impl FakeCluster {
    fn new() -> Self {
        Self {
            vault: Mutex::new(VaultSim {
                sealed: true,
                ..VaultSim::default()
            }),
            ..Self::default()
        }
    }

    fn vault_installed(&self) -> bool {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .any(|(_, release)| release == "vault")
    }

    /// Simulate a controller restart: the store comes back sealed
    fn restart_sealed(&self) {
        self.vault.lock().unwrap().sealed = true;
    }

    /// Simulate credential loss: the stored secret is gone
    fn lose_stored_credential(&self) {
        self.secrets.lock().unwrap().clear();
    }

    fn stored_unseal_key(&self) -> Option<String> {
        self.secrets
            .lock()
            .unwrap()
            .values()
            .next()
            .and_then(|data| data.get("unseal_key").cloned())
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

#[async_trait]
impl ControlPlane for FakeCluster {
    async fn query(&self, query: &ResourceQuery) -> terrarium::Result<Option<Value>> {
        match query.kind {
            QueryKind::Release => {
                let installed = self
                    .releases
                    .lock()
                    .unwrap()
                    .contains(&(query.namespace.clone(), query.name.clone()));
                Ok(installed.then(|| json!({"info": {"status": "deployed"}})))
            }
            QueryKind::Secret => {
                let secrets = self.secrets.lock().unwrap();
                Ok(secrets
                    .get(&(query.namespace.clone(), query.name.clone()))
                    .map(|data| json!({ "data": data })))
            }
            QueryKind::ConfigMap => {
                let present = self.markers.lock().unwrap().contains(&query.name);
                Ok(present.then(|| json!({"data": {}})))
            }
            _ => {
                // Workloads are ready as soon as their namespace has a release
                let ready = self
                    .releases
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(namespace, _)| *namespace == query.namespace);
                if ready {
                    Ok(Some(
                        json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 1}}),
                    ))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn apply(&self, apply: &ResourceApply) -> terrarium::Result<()> {
        match apply {
            ResourceApply::Release {
                name, namespace, ..
            } => {
                self.release_applies.fetch_add(1, Ordering::SeqCst);
                self.releases
                    .lock()
                    .unwrap()
                    .insert((namespace.clone(), name.clone()));
                Ok(())
            }
            ResourceApply::Manifest { content } => {
                if let Ok(doc) = serde_json::from_str::<Value>(content) {
                    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
                    let name = doc
                        .pointer("/metadata/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let namespace = doc
                        .pointer("/metadata/namespace")
                        .and_then(Value::as_str)
                        .unwrap_or("default")
                        .to_string();
                    match kind {
                        "Secret" => {
                            // kubectl stores stringData as base64 data
                            let data = doc
                                .pointer("/stringData")
                                .and_then(Value::as_object)
                                .map(|fields| {
                                    fields
                                        .iter()
                                        .map(|(key, value)| {
                                            let raw = value.as_str().unwrap_or_default();
                                            (key.clone(), BASE64.encode(raw))
                                        })
                                        .collect::<HashMap<_, _>>()
                                })
                                .unwrap_or_default();
                            self.secrets.lock().unwrap().insert((namespace, name), data);
                        }
                        "ConfigMap" => {
                            self.markers.lock().unwrap().insert(name);
                        }
                        _ => {}
                    }
                }
                // Non-JSON manifests (the issuer YAML) are accepted as-is
                Ok(())
            }
        }
    }

    async fn delete(&self, kind: QueryKind, name: &str, _namespace: &str) -> terrarium::Result<()> {
        match kind {
            QueryKind::ConfigMap => {
                self.markers.lock().unwrap().remove(name);
            }
            QueryKind::Pod => {
                // Pod recreation on fresh storage wipes the store
                let mut vault = self.vault.lock().unwrap();
                vault.initialized = false;
                vault.sealed = true;
                vault.unseal_key = None;
            }
            QueryKind::PersistentVolumeClaim => {}
            _ => {}
        }
        Ok(())
    }

    async fn exec<'a>(
        &self,
        _target: &ExecTarget,
        command: &[String],
        stdin: Option<&'a str>,
    ) -> terrarium::Result<ExecOutput> {
        if !self.vault_installed() {
            return Err(Error::command("kubectl exec", "pod not found"));
        }

        let ok = |stdout: String, code: i32| {
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                code,
            })
        };

        if command.iter().any(|c| c == "status") {
            let vault = self.vault.lock().unwrap();
            let code = if vault.sealed { 2 } else { 0 };
            return ok(
                json!({"initialized": vault.initialized, "sealed": vault.sealed}).to_string(),
                code,
            );
        }

        if command.iter().any(|c| c == "init") {
            let mut vault = self.vault.lock().unwrap();
            if vault.initialized {
                return ok("Error: Vault is already initialized".to_string(), 2);
            }
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            vault.issued += 1;
            let key = format!("unseal-key-{}", vault.issued);
            let token = format!("root-token-{}", vault.issued);
            vault.initialized = true;
            vault.sealed = true;
            vault.unseal_key = Some(key.clone());
            return ok(
                json!({"unseal_keys_b64": [key], "root_token": token}).to_string(),
                0,
            );
        }

        if command.iter().any(|c| c == "unseal") {
            *self.last_unseal_argv.lock().unwrap() = command.to_vec();
            let mut vault = self.vault.lock().unwrap();
            let submitted = stdin.unwrap_or_default().trim();
            if vault.unseal_key.as_deref() == Some(submitted) {
                vault.sealed = false;
                return ok(json!({"sealed": false}).to_string(), 0);
            }
            return ok("Error: incorrect key".to_string(), 2);
        }

        if command.iter().any(|c| c.contains("sys/health")) {
            let vault = self.vault.lock().unwrap();
            let healthy = vault.initialized && !vault.sealed;
            return ok(String::new(), if healthy { 0 } else { 1 });
        }

        ok(String::new(), 0)
    }
}

fn test_config() -> EnvironmentConfig {
    let mut config = EnvironmentConfig::default();
    for component in [
        &mut config.ingress,
        &mut config.cert_manager,
        &mut config.secret_store.component,
        &mut config.monitoring,
        &mut config.postgres,
        &mut config.redis,
    ] {
        component.wait_seconds = 5;
    }
    config.secret_store.probe_timeout_seconds = 5;
    config.secret_store.unseal_timeout_seconds = 5;
    config.secret_store.ready_timeout_seconds = 5;
    config.secret_store.reset_timeout_seconds = 10;
    config
}

#[tokio::test]
async fn full_bringup_then_rerun_is_idempotent() {
    let cluster = Arc::new(FakeCluster::new());
    let environment = Environment::new(test_config(), cluster.clone());

    // First pass on an empty cluster: everything is applied
    let registry = environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();
    assert!(!registry.any_failed());
    for record in registry.records() {
        assert_ne!(
            record.outcome,
            EnsureOutcome::Skipped,
            "{} should have been applied on an empty cluster",
            record.name
        );
    }

    let applies_after_first = cluster.release_applies.load(Ordering::SeqCst);
    assert_eq!(cluster.init_calls.load(Ordering::SeqCst), 1);
    assert!(cluster.stored_unseal_key().is_some());

    // Second pass: every service is skipped, no new release upserts, and
    // the store is not re-initialized
    let registry = environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();
    for service in ["ingress-nginx", "cert-manager", "vault", "monitoring", "postgres", "redis"] {
        let record = registry
            .records()
            .iter()
            .find(|r| r.name == service)
            .expect("record present");
        assert_eq!(record.outcome, EnsureOutcome::Skipped, "{}", service);
    }
    assert_eq!(
        cluster.release_applies.load(Ordering::SeqCst),
        applies_after_first
    );
    assert_eq!(cluster.init_calls.load(Ordering::SeqCst), 1);

    // The session marker was created and removed both times
    assert!(cluster.markers.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sealed_store_with_stored_key_unseals_on_rerun() {
    let cluster = Arc::new(FakeCluster::new());
    let environment = Environment::new(test_config(), cluster.clone());

    environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();
    assert!(!cluster.vault.lock().unwrap().sealed);

    // Controller restart: the store comes back sealed but the key is stored
    cluster.restart_sealed();
    environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();

    assert!(!cluster.vault.lock().unwrap().sealed);
    // Still only one initialize ever
    assert_eq!(cluster.init_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lost_credential_triggers_reset_with_fresh_credential() {
    let cluster = Arc::new(FakeCluster::new());
    let environment = Environment::new(test_config(), cluster.clone());

    environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();
    let first_key = cluster.stored_unseal_key().unwrap();

    // Sealed store, stored key gone: the designed dev-only recovery path
    cluster.restart_sealed();
    cluster.lose_stored_credential();
    environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();

    let second_key = cluster.stored_unseal_key().unwrap();
    assert_ne!(first_key, second_key, "reset must issue a fresh credential");
    assert_eq!(cluster.init_calls.load(Ordering::SeqCst), 2);
    assert!(!cluster.vault.lock().unwrap().sealed);
}

#[tokio::test]
async fn unseal_key_never_appears_in_argv() {
    let cluster = Arc::new(FakeCluster::new());
    let environment = Environment::new(test_config(), cluster.clone());

    environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();

    let argv = cluster.last_unseal_argv.lock().unwrap().clone();
    assert!(!argv.is_empty(), "unseal was executed");
    assert!(argv.iter().any(|a| a == "-"), "key is read from stdin");
    assert!(
        argv.iter().all(|a| !a.contains("unseal-key-")),
        "key must not appear in the argument list: {:?}",
        argv
    );
}

#[tokio::test]
async fn interrupt_removes_session_marker_without_rollback() {
    let cluster = Arc::new(FakeCluster::new());
    let environment = Environment::new(test_config(), cluster.clone());

    // Bring everything up, then interrupt a rerun before its first step
    environment
        .converge(&CancellationToken::new())
        .await
        .unwrap();
    let installed_before = cluster.releases.lock().unwrap().len();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = environment.converge(&cancel).await.unwrap_err();
    assert!(err.to_string().contains("interrupted"));

    // Marker cleaned up, nothing rolled back
    assert!(!cluster
        .markers
        .lock()
        .unwrap()
        .contains(SESSION_MARKER_NAME));
    assert_eq!(cluster.releases.lock().unwrap().len(), installed_before);
}

#[tokio::test]
async fn status_on_empty_cluster_reports_not_installed() {
    let cluster = Arc::new(FakeCluster::new());
    let environment = Environment::new(test_config(), cluster.clone());

    let rows = environment.status().await.unwrap();
    for (name, state) in &rows {
        if name == "vault lifecycle" {
            // No pod to exec into: the probe's safe default reads unknown
            assert_eq!(state, "unknown");
        } else {
            assert_eq!(state, "not installed", "{}", name);
        }
    }
}
