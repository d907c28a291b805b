//! `{{expression}}` templating for parameter defaults and action inputs.
//!
//! # Syntax
//!
//! - `{{config.name}}`: dotted path into the environment
//! - `{{config.config.spec.containers[0].image}}`: array index access
//! - `{{last_action.stdout}}`: result of the previous completed action
//! - `{{get_action('backup').result.path}}`: any earlier action by name
//!
//! A string that is exactly one expression keeps the JSON type of the value
//! it resolves to; mixed text stringifies every expression.

use serde::Serialize;
use serde_json::{Map, Value};

use remedy_types::{Principal, Resource, RunAction};

use crate::error::{EngineError, Result};

/// The data templates and expressions are evaluated against.
///
/// Top-level keys: `config`, `component`, `check`, `canary`, `agent`,
/// `params`, `user`, `request`, `run`, `playbook`, `last_action`, `actions`,
/// `gitops`. Slots that do not apply to the run hold `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TemplateEnv {
    vars: Map<String, Value>,
}

impl TemplateEnv {
    /// An environment with every well-known slot set to `null`.
    pub fn new() -> Self {
        let mut vars = Map::new();
        for key in [
            "config",
            "component",
            "check",
            "canary",
            "agent",
            "request",
            "run",
            "playbook",
            "last_action",
            "gitops",
        ] {
            vars.insert(key.to_string(), Value::Null);
        }
        vars.insert("params".to_string(), Value::Object(Map::new()));
        vars.insert("actions".to_string(), Value::Object(Map::new()));
        vars.insert("user".to_string(), Value::Null);
        Self { vars }
    }

    /// Rebuild from a serialized environment (e.g. one shipped to an agent).
    pub fn from_value(value: Value) -> Self {
        let mut env = Self::new();
        if let Value::Object(map) = value {
            env.vars.extend(map);
        }
        env
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Populate the resource slot matching the target's class.
    pub fn with_resource(mut self, resource: Option<&Resource>) -> Self {
        if let Some(r) = resource {
            self.set(r.kind().as_str(), r.to_value());
        }
        self
    }

    pub fn with_params<'a>(mut self, params: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let map = params
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.set("params", Value::Object(map));
        self
    }

    pub fn with_user(mut self, user: Option<&Principal>) -> Self {
        if let Some(p) = user {
            self.set(
                "user",
                serde_json::json!({
                    "id": p.person.id,
                    "name": p.person.name,
                    "email": p.person.email,
                    "teams": p.teams.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
                }),
            );
        }
        self
    }

    pub fn with_request(mut self, request: Option<&Value>) -> Self {
        if let Some(r) = request {
            self.set("request", r.clone());
        }
        self
    }

    /// Record a finished action: it becomes `last_action` when it completed
    /// and is reachable through `get_action(name)` either way.
    pub fn record_action(&mut self, action: &RunAction) {
        let entry = serde_json::json!({
            "id": action.id,
            "status": action.status.as_str(),
            "result": action.result.clone().unwrap_or(Value::Null),
            "error": action.error,
        });
        if let Some(Value::Object(actions)) = self.vars.get_mut("actions") {
            actions.insert(action.name.clone(), entry);
        }
        if action.succeeded() {
            self.set("last_action", action.result.clone().unwrap_or(Value::Null));
        }
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.vars.clone())
    }

    /// Resolve every template in a JSON tree.
    pub fn render_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => self.render_string_value(s),
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (k, v) in map {
                    resolved.insert(k.clone(), self.render_value(v)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(arr) => arr
                .iter()
                .map(|v| self.render_value(v))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Resolve the templates in a string and stringify the result.
    pub fn render(&self, template: &str) -> Result<String> {
        Ok(match self.render_string_value(template)? {
            Value::String(s) => s,
            other => value_to_string(&other),
        })
    }

    /// Like [`render`](Self::render), but a path that does not resolve
    /// (typically through a null slot) renders as an empty string.
    pub fn render_lenient(&self, template: &str) -> String {
        let mut result = template.to_string();
        for expr in parse_template_expressions(template) {
            let resolved = self.resolve_expression(&expr.path).unwrap_or(Value::Null);
            result = result.replace(&expr.full_match, &value_to_string(&resolved));
        }
        result
    }

    fn render_string_value(&self, s: &str) -> Result<Value> {
        let expressions = parse_template_expressions(s);
        if expressions.is_empty() {
            return Ok(Value::String(s.to_string()));
        }

        if expressions.len() == 1 && expressions[0].full_match == s {
            return self.resolve_expression(&expressions[0].path);
        }

        let mut result = s.to_string();
        for expr in &expressions {
            let resolved = self.resolve_expression(&expr.path)?;
            result = result.replace(&expr.full_match, &value_to_string(&resolved));
        }
        Ok(Value::String(result))
    }

    fn resolve_expression(&self, path: &str) -> Result<Value> {
        let (root, rest) = match parse_get_action(path) {
            Some((name, rest)) => {
                let action = self
                    .vars
                    .get("actions")
                    .and_then(|a| a.get(name))
                    .ok_or_else(|| {
                        EngineError::Template(format!("'{{{{{path}}}}}': no action named '{name}'"))
                    })?;
                (action, rest)
            }
            None => {
                let (head, rest) = path.split_once('.').unwrap_or((path, ""));
                let head = parse_segment(head);
                let root = self.vars.get(&head.name).ok_or_else(|| {
                    EngineError::Template(format!(
                        "'{{{{{path}}}}}': unknown context key '{}'",
                        head.name
                    ))
                })?;
                let root = match head.index {
                    Some(i) => root.get(i).ok_or_else(|| {
                        EngineError::Template(format!("'{{{{{path}}}}}': index {i} out of range"))
                    })?,
                    None => root,
                };
                (root, rest)
            }
        };

        let mut current = root;
        for segment in rest.split('.').filter(|s| !s.is_empty()).map(parse_segment) {
            current = navigate_segment(current, &segment).ok_or_else(|| {
                EngineError::Template(format!(
                    "'{{{{{path}}}}}': cannot resolve segment '{segment}'"
                ))
            })?;
        }
        Ok(current.clone())
    }
}

/// A parsed `{{expression}}` occurrence in a string.
#[derive(Debug)]
struct TemplateExpression {
    full_match: String,
    path: String,
}

fn parse_template_expressions(s: &str) -> Vec<TemplateExpression> {
    let mut results = Vec::new();
    let mut remaining = s;

    while let Some(start) = remaining.find("{{") {
        let Some(end) = remaining[start..].find("}}") else {
            break;
        };
        let full_end = start + end + 2;
        let inner = remaining[start + 2..start + end].trim();
        if !inner.is_empty() {
            results.push(TemplateExpression {
                full_match: remaining[start..full_end].to_string(),
                path: inner.to_string(),
            });
        }
        remaining = &remaining[full_end..];
    }

    results
}

/// `get_action('name').rest` -> `("name", "rest")`.
fn parse_get_action(path: &str) -> Option<(&str, &str)> {
    let args = path.strip_prefix("get_action(")?;
    let close = args.find(')')?;
    let name = args[..close].trim().trim_matches(|c| c == '\'' || c == '"');
    let rest = args[close + 1..].trim_start_matches('.');
    Some((name, rest))
}

#[derive(Debug)]
struct PathSegment {
    name: String,
    index: Option<usize>,
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.name, i),
            None => write!(f, "{}", self.name),
        }
    }
}

fn parse_segment(part: &str) -> PathSegment {
    if let Some(open) = part.find('[')
        && let Some(close) = part.find(']')
        && open < close
    {
        return PathSegment {
            name: part[..open].to_string(),
            index: part[open + 1..close].parse().ok(),
        };
    }
    PathSegment {
        name: part.to_string(),
        index: None,
    }
}

fn navigate_segment<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    let field = if segment.name.is_empty() {
        value
    } else {
        value.get(&segment.name)?
    };
    match segment.index {
        Some(i) => field.get(i),
        None => Some(field),
    }
}

/// Stringify a JSON value for interpolation into text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
