//! Parameter validation and default expansion.
//!
//! Runs are persisted with their final parameter map: caller-supplied values
//! over templated defaults from the playbook spec. Validation happens before
//! anything is written, so a rejected request never produces a run.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::warn;

use remedy_types::{Playbook, Principal, Resource, ResourceSelector};

use crate::cel::CelEngine;
use crate::error::{EngineError, Result};
use crate::template::TemplateEnv;

/// Inputs to parameter preparation.
#[derive(Debug, Clone, Copy)]
pub struct ParamRequest<'a> {
    pub playbook: &'a Playbook,
    pub resource: Option<&'a Resource>,
    pub supplied: &'a HashMap<String, String>,
    pub user: Option<&'a Principal>,
    pub request: Option<&'a Value>,
}

/// Validate `req` and return the merged parameter map.
///
/// In order: unknown parameters are rejected, the target must satisfy the
/// playbook's resource selectors, missing parameters are filled from their
/// templated defaults, and every required parameter must end up non-empty.
pub fn prepare_params(cel: &CelEngine, req: ParamRequest<'_>) -> Result<HashMap<String, String>> {
    let spec = &req.playbook.spec;

    if let Some(unknown) = req
        .supplied
        .keys()
        .find(|k| !spec.parameters.iter().any(|p| &p.name == *k))
    {
        return Err(EngineError::Validation(format!(
            "unknown parameter '{unknown}' for playbook '{}'",
            req.playbook.name
        )));
    }

    if let Some(resource) = req.resource {
        check_target(cel, req.playbook, resource)?;
    }

    fill_defaults(req, req.supplied.clone())
}

/// Fill missing parameters from their templated defaults, then check that
/// every required parameter is non-empty.
pub fn fill_defaults(
    req: ParamRequest<'_>,
    mut params: HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let spec = &req.playbook.spec;
    for param in &spec.parameters {
        let missing = params.get(&param.name).is_none_or(|v| v.is_empty());
        if !missing {
            continue;
        }
        if let Some(default) = &param.default {
            let env = TemplateEnv::new()
                .with_resource(req.resource)
                .with_params(&params)
                .with_user(req.user)
                .with_request(req.request);
            let value = if param.required {
                env.render(default).map_err(|e| {
                    EngineError::Validation(format!("default for parameter '{}': {e}", param.name))
                })?
            } else {
                env.render_lenient(default)
            };
            params.insert(param.name.clone(), value);
        }
    }

    for param in spec.parameters.iter().filter(|p| p.required) {
        if params.get(&param.name).is_none_or(|v| v.trim().is_empty()) {
            return Err(EngineError::Validation(format!(
                "missing required parameter '{}'",
                param.name
            )));
        }
    }

    Ok(params)
}

/// Ensure `resource` is allowed by the playbook's selectors for its class.
pub fn check_target(cel: &CelEngine, playbook: &Playbook, resource: &Resource) -> Result<()> {
    let kind = resource.kind();
    let selectors = playbook.spec.selectors(kind);
    if selectors.is_empty() {
        return Err(EngineError::Validation(format!(
            "playbook '{}' cannot run on {kind}s",
            playbook.name
        )));
    }
    if selectors.iter().any(|s| selector_matches(cel, s, resource)) {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "{kind} '{}' does not match the resource filters of playbook '{}'",
            resource.name(),
            playbook.name
        )))
    }
}

/// Whether one selector admits `resource`. Every set field must match.
pub fn selector_matches(cel: &CelEngine, selector: &ResourceSelector, resource: &Resource) -> bool {
    if !selector.types.is_empty() && !selector.types.iter().any(|t| type_matches(t, resource)) {
        return false;
    }
    if !resource.has_labels(&selector.labels) {
        return false;
    }
    if let Some(name) = &selector.name
        && !name_matches(name, resource.name())
    {
        return false;
    }
    if let Some(filter) = &selector.filter {
        let mut vars = Map::new();
        vars.insert(resource.kind().as_str().to_string(), resource.to_value());
        match cel.evaluate_bool(filter, &vars) {
            Ok(matched) => return matched,
            Err(e) => {
                warn!(filter = %filter, error = %e, "Resource filter failed, treating as no match");
                return false;
            }
        }
    }
    true
}

fn type_matches(wanted: &str, resource: &Resource) -> bool {
    if wanted == resource.resource_type() {
        return true;
    }
    match resource {
        Resource::Config(c) => wanted == c.config_class,
        _ => false,
    }
}

fn name_matches(pattern: &str, name: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(name),
        Err(_) => pattern == name,
    }
}
