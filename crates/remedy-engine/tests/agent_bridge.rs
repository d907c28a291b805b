//! Host and agent exchanging a delegated action over the bridge.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drive_until, engine_at, engine_with, exec, save};
use remedy_config::{AgentConfig, RemedyConfig};
use remedy_engine::LocalUpstream;
use remedy_types::{ActionStatus, PlaybookSpec, RunRequest, RunStatus};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_agent_round_trip_completes_host_run() {
    let host_dir = tempfile::tempdir().unwrap();
    let agent_dir = tempfile::tempdir().unwrap();
    let host = engine_at(host_dir.path());
    let agent = engine_with(
        agent_dir.path(),
        RemedyConfig {
            agent: Some(AgentConfig {
                name: "a1".into(),
                upstream: "http://host.invalid".into(),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let playbook = save(
        &host,
        "remote-diagnose",
        PlaybookSpec {
            runs_on: vec!["a1".into()],
            actions: vec![exec("diagnose", "echo on-agent")],
            ..Default::default()
        },
    );
    let created = host.submit_run(&RunRequest::new(playbook.id), None).unwrap();
    let run = drive_until(&host, created.run_id, RunStatus::Waiting, Duration::from_secs(10)).await;
    let delegated = host.store().get_action_by_name(run.id, "diagnose").unwrap().unwrap();
    assert_eq!(delegated.status, ActionStatus::ScheduledOnAgent);

    let worker = agent
        .agent_worker(Arc::new(LocalUpstream::new(host.upstream_host().clone())))
        .expect("agent mode");
    let done = worker
        .pull_once(&CancellationToken::new())
        .await
        .unwrap()
        .expect("an action for a1");
    assert_eq!(done.id, delegated.id);
    assert_eq!(done.status, ActionStatus::Completed);

    // Nothing left to pull.
    assert!(
        worker
            .pull_once(&CancellationToken::new())
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(worker.push_once().await.unwrap(), 1);
    let on_host = host.store().get_action(done.id).unwrap().unwrap();
    assert!(on_host.is_pushed);
    assert_eq!(on_host.status, ActionStatus::Completed);
    assert_eq!(on_host.result.unwrap()["stdout"], "on-agent");

    let run = drive_until(&host, run.id, RunStatus::Completed, Duration::from_secs(10)).await;
    assert!(run.end_time.is_some());
    let agent_row = host.store().get_agent_by_name("a1").unwrap().unwrap();
    assert!(agent_row.last_seen.is_some());
}

#[tokio::test]
async fn test_background_loops_drive_the_bridge() {
    let host_dir = tempfile::tempdir().unwrap();
    let agent_dir = tempfile::tempdir().unwrap();
    let host = engine_at(host_dir.path());
    let agent = engine_with(
        agent_dir.path(),
        RemedyConfig {
            agent: Some(AgentConfig {
                name: "a1".into(),
                upstream: "http://host.invalid".into(),
                push_interval_secs: 1,
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    let playbook = save(
        &host,
        "remote",
        PlaybookSpec {
            runs_on: vec!["a1".into()],
            actions: vec![exec("one", "echo 1"), exec("two", "echo 2")],
            ..Default::default()
        },
    );

    let shutdown = CancellationToken::new();
    let mut tasks = host.start(shutdown.clone()).unwrap();
    let worker = agent
        .agent_worker(Arc::new(LocalUpstream::new(host.upstream_host().clone())))
        .unwrap();
    tasks.push(tokio::spawn(worker.run(shutdown.clone())));

    let created = host.submit_run(&RunRequest::new(playbook.id), None).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let run = host.store().require_run(created.run_id).unwrap();
        if run.status == RunStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run stuck in {}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    for task in tasks {
        task.await.unwrap();
    }
    let actions = host.store().list_actions(created.run_id).unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|a| a.status == ActionStatus::Completed && a.is_pushed));
}
