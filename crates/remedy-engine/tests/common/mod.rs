//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use remedy_config::{EngineConfig, RemedyConfig};
use remedy_engine::Engine;
use remedy_store::Store;
use remedy_types::{ExecAction, Playbook, PlaybookAction, PlaybookSpec, Run, RunStatus};
use uuid::Uuid;

/// An engine over an on-disk store in `dir`.
pub fn engine_at(dir: &Path) -> Engine {
    engine_with(dir, RemedyConfig::default())
}

pub fn engine_with(dir: &Path, mut config: RemedyConfig) -> Engine {
    config.engine.get_or_insert_with(EngineConfig::default).poll_interval_secs = 1;
    let store = Arc::new(Store::open(dir.join("remedy.db")).unwrap());
    Engine::new(config, store).unwrap()
}

pub fn exec(name: &str, script: &str) -> PlaybookAction {
    PlaybookAction {
        name: name.into(),
        exec: Some(ExecAction {
            script: script.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn save(engine: &Engine, name: &str, spec: PlaybookSpec) -> Playbook {
    engine
        .store()
        .upsert_playbook(&Playbook::new(name, spec))
        .unwrap()
}

/// Tick the scheduler until the run reaches `status` or `timeout` elapses.
pub async fn drive_until(engine: &Engine, run_id: Uuid, status: RunStatus, timeout: Duration) -> Run {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        engine.scheduler().tick().unwrap();
        let run = engine.store().require_run(run_id).unwrap();
        if run.status == status {
            return run;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("run {run_id} is {} after {timeout:?}, expected {status}", run.status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
