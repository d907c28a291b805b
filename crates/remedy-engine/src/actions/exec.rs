//! `exec`: a shell script in a scratch directory.

use std::path::Path;
use std::process::Stdio;

use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use remedy_types::{Artifact, ExecAction};

use super::{ActionContext, ActionOutput, tail};
use crate::error::{EngineError, Result};

const ERROR_TAIL_CHARS: usize = 2000;

pub(super) async fn run(ctx: &ActionContext, spec: &ExecAction) -> Result<ActionOutput> {
    let scratch = tempfile::Builder::new().prefix("remedy-exec-").tempdir()?;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.script)
        .current_dir(scratch.path())
        .envs(&spec.env)
        .env("REMEDY_RUN_ID", ctx.run.id.to_string())
        .env("REMEDY_ACTION", &ctx.action.name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(run_id = %ctx.run.id, action = %ctx.action.name, "Spawning exec action");
    let output = cmd
        .output()
        .await
        .map_err(|e| EngineError::ActionFailed(format!("failed to start shell: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code().unwrap_or(-1);
    let result = json!({
        "stdout": stdout,
        "stderr": stderr,
        "exitCode": exit_code,
    });

    let artifacts = collect_artifacts(ctx, scratch.path(), &spec.artifacts).await;

    if output.status.success() {
        Ok(ActionOutput {
            result,
            artifacts,
            failure: None,
        })
    } else {
        let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
        Ok(ActionOutput {
            result,
            artifacts,
            failure: Some(format!(
                "exit status {exit_code}: {}",
                tail(detail, ERROR_TAIL_CHARS)
            )),
        })
    }
}

/// Save every file matching `patterns` (relative to `dir`). Failures are
/// logged and the file is left out.
async fn collect_artifacts(ctx: &ActionContext, dir: &Path, patterns: &[String]) -> Vec<Artifact> {
    let Some(store) = &ctx.artifacts else {
        if !patterns.is_empty() {
            warn!(action = %ctx.action.name, "Artifacts declared but no artifact connection is configured");
        }
        return Vec::new();
    };

    let mut saved = Vec::new();
    for pattern in patterns {
        let full = dir.join(pattern);
        let entries = match glob::glob(&full.to_string_lossy()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid artifact pattern");
                continue;
            }
        };
        for path in entries.flatten().filter(|p| p.is_file()) {
            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            let declared = relative.to_string_lossy().replace('\\', "/");
            match store
                .save_file(ctx.run.id, ctx.action.id, &declared, &path)
                .await
            {
                Ok(artifact) => saved.push(artifact),
                Err(e) => warn!(
                    run_id = %ctx.run.id,
                    action = %ctx.action.name,
                    path = %declared,
                    error = %e,
                    "Failed to save artifact, skipping"
                ),
            }
        }
    }
    saved
}
