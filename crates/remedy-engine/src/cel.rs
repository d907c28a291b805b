//! CEL evaluation for trigger filters, resource selectors and action gates.
//!
//! Programs are compiled once per source string and kept in a bounded TTL
//! cache. The evaluation environment only ever contains plain data and a
//! handful of pure helper functions; expressions have no way to reach I/O.

use std::sync::Arc;
use std::time::Duration;

use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::{Map, Value};
use tracing::trace;

use crate::cache::TtlCache;
use crate::error::{EngineError, Result};

const PROGRAM_CACHE_CAPACITY: usize = 512;
const PROGRAM_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Outcome of the actions that ran before the one being gated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorOutcome {
    /// Some earlier action failed.
    pub failed: bool,
    /// Some earlier action failed by timing out.
    pub timed_out: bool,
}

/// Decision of an action's `if` gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Run,
    Skip,
}

/// Compiles and evaluates CEL expressions.
pub struct CelEngine {
    programs: TtlCache<String, Arc<Program>>,
}

impl std::fmt::Debug for CelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelEngine")
            .field("cached_programs", &self.programs.len())
            .finish()
    }
}

impl Default for CelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CelEngine {
    pub fn new() -> Self {
        Self {
            programs: TtlCache::new(PROGRAM_CACHE_CAPACITY, PROGRAM_CACHE_TTL),
        }
    }

    /// Compile `source`, reusing a cached program when possible.
    pub fn compile(&self, source: &str) -> Result<Arc<Program>> {
        self.programs
            .get_or_try_insert_with(source.to_string(), || {
                trace!(expression = source, "Compiling CEL program");
                Program::compile(source)
                    .map(Arc::new)
                    .map_err(|e| EngineError::Expression(format!("compile '{source}': {e}")))
            })
    }

    /// Evaluate `source` against `vars`.
    pub fn evaluate(&self, source: &str, vars: &Map<String, Value>) -> Result<CelValue> {
        self.evaluate_with(source, vars, PriorOutcome::default())
    }

    /// Evaluate a filter expression that must produce a bool.
    pub fn evaluate_bool(&self, source: &str, vars: &Map<String, Value>) -> Result<bool> {
        match self.evaluate(source, vars)? {
            CelValue::Bool(b) => Ok(b),
            other => Err(EngineError::Expression(format!(
                "'{source}' evaluated to {other:?}, expected a bool"
            ))),
        }
    }

    /// Evaluate an action's `if` gate.
    ///
    /// An absent gate runs the action unless an earlier action failed. The
    /// bare words `always`, `skip`, `success`, `failure` and `timeout` are
    /// shorthand for the helper function of the same name.
    pub fn evaluate_gate(
        &self,
        gate: Option<&str>,
        vars: &Map<String, Value>,
        prior: PriorOutcome,
    ) -> Result<Gate> {
        let Some(source) = gate.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(if prior.failed { Gate::Skip } else { Gate::Run });
        };

        let source = match source {
            "always" | "skip" | "success" | "failure" | "timeout" => format!("{source}()"),
            other => other.to_string(),
        };

        match self.evaluate_with(&source, vars, prior)? {
            CelValue::Bool(true) => Ok(Gate::Run),
            CelValue::Bool(false) => Ok(Gate::Skip),
            CelValue::String(s) => match s.as_str() {
                "always" | "true" => Ok(Gate::Run),
                "skip" | "false" => Ok(Gate::Skip),
                other => Err(EngineError::Expression(format!(
                    "gate '{source}' returned unsupported value '{other}'"
                ))),
            },
            other => Err(EngineError::Expression(format!(
                "gate '{source}' returned {other:?}"
            ))),
        }
    }

    pub fn cached_programs(&self) -> usize {
        self.programs.len()
    }

    fn evaluate_with(
        &self,
        source: &str,
        vars: &Map<String, Value>,
        prior: PriorOutcome,
    ) -> Result<CelValue> {
        let program = self.compile(source)?;
        let mut ctx = Context::default();
        for (name, value) in vars {
            ctx.add_variable(name.as_str(), value)
                .map_err(|e| EngineError::Expression(format!("variable '{name}': {e}")))?;
        }

        let failed = prior.failed;
        let timed_out = prior.timed_out;
        ctx.add_function("always", || true);
        ctx.add_function("skip", || false);
        ctx.add_function("success", move || !failed);
        ctx.add_function("failure", move || failed);
        ctx.add_function("timeout", move || timed_out);

        program
            .execute(&ctx)
            .map_err(|e| EngineError::Expression(format!("evaluate '{source}': {e}")))
    }
}
