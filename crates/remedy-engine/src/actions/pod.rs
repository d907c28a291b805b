//! `pod`: a short-lived Kubernetes pod, driven through `kubectl`.
//!
//! The pod is created with `restartPolicy: Never`, polled until it reaches
//! a terminal phase, and its logs become the result. A guard deletes the pod
//! on every exit path, including when the action future is dropped by a
//! timeout or cancellation.

use std::process::Stdio;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use remedy_config::{ConnectionConfig, ConnectionType};
use remedy_types::PodAction;

use super::{ActionContext, ActionOutput, tail};
use crate::error::{EngineError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_NAMESPACE: &str = "default";

pub(super) async fn run(ctx: &ActionContext, spec: &PodAction) -> Result<ActionOutput> {
    let connection = match &spec.connection {
        Some(name) => {
            let conn = ctx.config.connection(name)?;
            if conn.kind != ConnectionType::Kubernetes {
                return Err(EngineError::Validation(format!(
                    "connection '{name}' is not a kubernetes connection"
                )));
            }
            Some(conn.clone())
        }
        None => None,
    };
    let kubectl = Kubectl {
        connection,
        namespace: spec
            .namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
    };

    let name = pod_name(&spec.name, &ctx.run.id.simple().to_string());
    let manifest = manifest(&name, &kubectl.namespace, &spec.spec, &ctx.run.id.to_string());

    kubectl.apply(&manifest).await?;
    let _cleanup = PodGuard {
        kubectl: kubectl.clone(),
        name: name.clone(),
    };
    debug!(run_id = %ctx.run.id, pod = %name, "Pod created");

    let phase = loop {
        let phase = kubectl
            .output(&["get", "pod", name.as_str(), "-o", "jsonpath={.status.phase}"])
            .await?;
        match phase.trim() {
            "Succeeded" | "Failed" => break phase.trim().to_string(),
            _ => tokio::time::sleep(POLL_INTERVAL).await,
        }
    };

    let logs = kubectl.output(&["logs", name.as_str()]).await.unwrap_or_else(|e| {
        warn!(pod = %name, error = %e, "Failed to fetch pod logs");
        String::new()
    });

    let result = json!({ "pod": name, "phase": phase, "logs": logs });
    if phase == "Succeeded" {
        Ok(ActionOutput::ok(result))
    } else {
        Ok(ActionOutput::failed(
            result,
            format!("pod {name} failed: {}", tail(&logs, 2000)),
        ))
    }
}

/// DNS-1123 pod name unique to the run.
fn pod_name(base: &str, run: &str) -> String {
    let mut clean: String = base
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    clean.truncate(50);
    let clean = clean.trim_matches('-');
    let suffix = &run[..run.len().min(8)];
    if clean.is_empty() {
        format!("remedy-{suffix}")
    } else {
        format!("{clean}-{suffix}")
    }
}

fn manifest(name: &str, namespace: &str, spec: &Value, run_id: &str) -> Value {
    let mut pod_spec = match spec {
        Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    pod_spec.insert("restartPolicy".to_string(), json!("Never"));
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { "remedy/run-id": run_id },
        },
        "spec": pod_spec,
    })
}

#[derive(Debug, Clone)]
struct Kubectl {
    connection: Option<ConnectionConfig>,
    namespace: String,
}

impl Kubectl {
    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(conn) = &self.connection {
            if let Some(path) = &conn.kubeconfig {
                args.push(format!("--kubeconfig={}", path.display()));
            }
            if let Some(context) = &conn.context {
                args.push(format!("--context={context}"));
            }
        }
        args.push(format!("--namespace={}", self.namespace));
        args
    }

    async fn apply(&self, manifest: &Value) -> Result<()> {
        let mut child = Command::new("kubectl")
            .args(self.base_args())
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::ActionFailed(format!("failed to start kubectl: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(manifest.to_string().as_bytes()).await?;
        }
        let out = child.wait_with_output().await?;
        if !out.status.success() {
            return Err(EngineError::ActionFailed(format!(
                "kubectl apply: {}",
                tail(&String::from_utf8_lossy(&out.stderr), 2000)
            )));
        }
        Ok(())
    }

    async fn output(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("kubectl")
            .args(self.base_args())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::ActionFailed(format!("failed to start kubectl: {e}")))?;
        if !out.status.success() {
            return Err(EngineError::ActionFailed(format!(
                "kubectl {}: {}",
                args.first().copied().unwrap_or_default(),
                tail(&String::from_utf8_lossy(&out.stderr), 2000)
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Deletes the pod when dropped.
struct PodGuard {
    kubectl: Kubectl,
    name: String,
}

impl Drop for PodGuard {
    fn drop(&mut self) {
        let spawned = std::process::Command::new("kubectl")
            .args(self.kubectl.base_args())
            .args(["delete", "pod", self.name.as_str(), "--ignore-not-found", "--wait=false"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                // Reap in the background so the child does not linger as a zombie.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => warn!(pod = %self.name, error = %e, "Failed to delete pod"),
        }
    }
}
