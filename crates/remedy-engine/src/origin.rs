//! Where a Kubernetes config item is declared in git.
//!
//! Resolved into the `gitops` template slot so actions can edit the source
//! of a live object:
//!
//! ```text
//! gitops.git.url        repository of the Flux GitRepository
//! gitops.git.branch     its tracked branch
//! gitops.git.file       manifest path inside the repository
//! gitops.git.dir        directory of that manifest
//! gitops.kustomize.path Kustomization spec.path
//! gitops.kustomize.file kustomization.yaml inside that path
//! ```
//!
//! Two sources feed it: the `config.kubernetes.io/origin` annotation that
//! kustomize writes (manifest path relative to the kustomization), and the
//! Flux labels naming the owning Kustomization, whose `sourceRef` leads to
//! the GitRepository.

use serde_json::{Value, json};
use tracing::debug;

use remedy_store::Store;
use remedy_types::ConfigItem;

use crate::error::Result;

pub const ORIGIN_ANNOTATION: &str = "config.kubernetes.io/origin";
pub const FLUX_NAME_LABEL: &str = "kustomize.toolkit.fluxcd.io/name";
pub const FLUX_NAMESPACE_LABEL: &str = "kustomize.toolkit.fluxcd.io/namespace";

const KUSTOMIZATION_TYPE: &str = "Kubernetes::Kustomization";
const GIT_REPOSITORY_TYPE: &str = "Kubernetes::GitRepository";

/// The `gitops` slot for `item`, or null when it carries no origin data.
pub fn gitops_source(store: &Store, item: &ConfigItem) -> Result<Value> {
    let origin = origin_path(item);
    let kustomization = match label(item, FLUX_NAME_LABEL) {
        Some(name) => {
            let ns = label(item, FLUX_NAMESPACE_LABEL).unwrap_or_else(|| namespace(&item.config));
            find(store, KUSTOMIZATION_TYPE, &name, &ns)?
        }
        None => None,
    };
    if origin.is_none() && kustomization.is_none() {
        return Ok(Value::Null);
    }

    let kustomize_path = kustomization
        .as_ref()
        .and_then(|k| k.config.pointer("/spec/path"))
        .and_then(Value::as_str)
        .map(clean)
        .unwrap_or_default();

    let repository = match &kustomization {
        Some(k) => source_repository(store, k)?,
        None => None,
    };
    let spec = |path: &str| {
        repository
            .as_ref()
            .and_then(|r| r.config.pointer(path))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let file = origin
        .as_deref()
        .map(|o| join(&kustomize_path, o))
        .unwrap_or_default();
    let dir = file.rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default();
    debug!(config = %item.name, file = %file, "Resolved gitops source");

    Ok(json!({
        "git": {
            "url": spec("/spec/url"),
            "branch": spec("/spec/ref/branch"),
            "file": file,
            "dir": dir,
        },
        "kustomize": {
            "path": kustomize_path,
            "file": join(&kustomize_path, "kustomization.yaml"),
        },
    }))
}

/// The manifest path recorded by kustomize, e.g. `path: apps/web/deploy.yaml`.
fn origin_path(item: &ConfigItem) -> Option<String> {
    let raw = item
        .config
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ORIGIN_ANNOTATION))
        .and_then(Value::as_str)?;
    let origin: Value = serde_yaml::from_str(raw).ok()?;
    origin.get("path").and_then(Value::as_str).map(clean)
}

fn source_repository(store: &Store, kustomization: &ConfigItem) -> Result<Option<ConfigItem>> {
    let Some(source) = kustomization.config.pointer("/spec/sourceRef") else {
        return Ok(None);
    };
    if source.get("kind").and_then(Value::as_str) != Some("GitRepository") {
        return Ok(None);
    }
    let Some(name) = source.get("name").and_then(Value::as_str) else {
        return Ok(None);
    };
    let ns = source
        .get("namespace")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| namespace(&kustomization.config));
    find(store, GIT_REPOSITORY_TYPE, name, &ns)
}

fn find(store: &Store, config_type: &str, name: &str, ns: &str) -> Result<Option<ConfigItem>> {
    Ok(store
        .find_config_items(config_type, name)?
        .into_iter()
        .find(|c| namespace(&c.config) == ns))
}

/// Labels live on the item and in the manifest; either counts.
fn label(item: &ConfigItem, key: &str) -> Option<String> {
    item.labels.get(key).cloned().or_else(|| {
        item.config
            .pointer("/metadata/labels")
            .and_then(|l| l.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

fn namespace(config: &Value) -> String {
    config
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string()
}

fn clean(path: &str) -> String {
    path.trim().trim_start_matches("./").trim_matches('/').to_string()
}

fn join(dir: &str, file: &str) -> String {
    match (dir.is_empty(), file.is_empty()) {
        (true, _) => file.to_string(),
        (_, true) => dir.to_string(),
        _ => format!("{dir}/{file}"),
    }
}
