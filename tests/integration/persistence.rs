//! Persistence tests.
//!
//! These tests run whole projects through [`ProjectRunner`] backed by a
//! [`JsonStateStore`] in a temporary directory and verify:
//! - Snapshots on disk match the final in-memory state
//! - Interrupted projects resume and fail their stale tasks
//! - Configuration files select strategy and state directory

use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use maos::config::Config;
use maos::core::{ProjectState, ProjectStatus, TaskStatus, Team};
use maos::orchestration::{ExecutionMode, ParallelStrategy, ProjectRunner};
use maos::state::{JsonStateStore, StateStore};
use maos::Error;

use crate::fixtures::{diamond, registry, test_task, MockExecutor};

fn runner(store: Arc<JsonStateStore>, executor: Arc<MockExecutor>) -> ProjectRunner {
    ProjectRunner::new(Config::default(), registry(executor), store)
        .with_mode(ExecutionMode::Parallel)
}

/// Test: A completed run is fully persisted
///
/// Given a runner backed by a JSON store
/// When a diamond project runs to completion
/// Then the snapshot on disk has every task complete with its artifacts
#[tokio::test]
async fn test_completed_project_on_disk() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));
    let runner = runner(store.clone(), Arc::new(MockExecutor::instant()));

    let state = runner.start("Ship the diamond", diamond()).await.unwrap();
    assert_eq!(state.status(), ProjectStatus::Complete);
    assert!(store.state_path(&state.id).exists());

    let loaded = store.load(&state.id).await.unwrap();
    assert_eq!(loaded.status(), ProjectStatus::Complete);
    assert_eq!(loaded.tasks().len(), 4);
    assert!(loaded.all_complete());
    assert_eq!(
        loaded.get_task(&"a".into()).unwrap().artifacts,
        vec!["artifact://a".to_string()]
    );

    let usage = &loaded.agents()["mock"];
    assert_eq!(usage.call_count, 4);
    assert_eq!(usage.tokens_used, 400);
    assert!(loaded
        .logs()
        .iter()
        .any(|e| e.message == "Project completed successfully"));
}

/// Test: Projects are listed with their final status
///
/// Given two projects, one of which fails
/// When the runner lists projects
/// Then both appear with the right status and counts
#[tokio::test]
async fn test_list_projects() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));
    let runner = runner(store, Arc::new(MockExecutor::instant().failing(["bad"])));

    let good = runner.start("Good", diamond()).await.unwrap();
    let bad = runner
        .start("Bad", vec![test_task("bad", Team::Backend, &[])])
        .await
        .unwrap();

    let listed = runner.list_projects().await.unwrap();
    assert_eq!(listed.len(), 2);
    let good_summary = listed.iter().find(|s| s.id == good.id).unwrap();
    assert_eq!(good_summary.status, ProjectStatus::Complete);
    assert_eq!(good_summary.counts.complete, 4);
    let bad_summary = listed.iter().find(|s| s.id == bad.id).unwrap();
    assert_eq!(bad_summary.status, ProjectStatus::Failed);
    assert_eq!(bad_summary.counts.failed, 1);

    let teams = runner.team_status(&good.id).await.unwrap();
    assert_eq!(teams[&Team::Qa].complete, 1);
}

/// Test: Duplicate task ids abort planning but keep a record
///
/// Given two tasks with the same id
/// When a project is started
/// Then start fails and the stored project is marked failed
#[tokio::test]
async fn test_duplicate_ids_saved_as_failed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));
    let executor = Arc::new(MockExecutor::instant());
    let runner = runner(store, executor.clone());

    let result = runner
        .start(
            "Duplicates",
            vec![
                test_task("x", Team::General, &[]),
                test_task("x", Team::Qa, &[]),
            ],
        )
        .await;
    assert!(matches!(result, Err(Error::DuplicateTaskId(_))));

    let listed = runner.list_projects().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ProjectStatus::Failed);
    assert_eq!(executor.call_count(), 0);
}

/// Test: Resuming an interrupted project
///
/// Given a stored project left executing with one task in progress
/// When the runner resumes it
/// Then the stale task fails, its dependent stays queued, and unrelated work completes
#[tokio::test]
async fn test_resume_interrupted_project() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));

    let mut state = ProjectState::new("Interrupted");
    state.add_task(test_task("stale", Team::Backend, &[])).unwrap();
    state.add_task(test_task("after", Team::Qa, &["stale"])).unwrap();
    state.add_task(test_task("other", Team::Documentation, &[])).unwrap();
    state.set_status(ProjectStatus::Executing);
    state
        .update_task_status(&"stale".into(), TaskStatus::InProgress, None)
        .unwrap();
    store.save(&state).await.unwrap();

    let executor = Arc::new(MockExecutor::instant());
    let runner = runner(store.clone(), executor.clone());
    let resumed = runner.resume(&state.id).await.unwrap();

    let stale = resumed.get_task(&"stale".into()).unwrap();
    assert_eq!(stale.status, TaskStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some("interrupted before completion"));
    assert_eq!(
        resumed.get_task(&"after".into()).unwrap().status,
        TaskStatus::Queued
    );
    assert_eq!(
        resumed.get_task(&"other".into()).unwrap().status,
        TaskStatus::Complete
    );
    assert_eq!(resumed.status(), ProjectStatus::Failed);
    assert_eq!(executor.calls().len(), 1);

    let loaded = store.load(&state.id).await.unwrap();
    assert_eq!(loaded.status(), ProjectStatus::Failed);
}

/// Test: Finished projects cannot be resumed
#[tokio::test]
async fn test_resume_finished_project_rejected() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStateStore::new(dir.path()));
    let runner = runner(store, Arc::new(MockExecutor::instant()));

    let state = runner.start("Done", diamond()).await.unwrap();
    let result = runner.resume(&state.id).await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

/// Test: A config file drives strategy and state location
///
/// Given a TOML config selecting a conservative strategy and a state directory
/// When a runner is built from it and a project runs
/// Then the strategy applies and the snapshot lands in the configured directory
#[tokio::test]
async fn test_config_file_drives_runner() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    let config_path = dir.path().join("maos.toml");
    fs::write(
        &config_path,
        format!(
            "state_dir = {:?}\n\n[orchestrator]\nstrategy = \"conservative\"\ngroup_timeout_secs = 60\n",
            state_dir.display().to_string()
        ),
    )
    .unwrap();

    let config = Config::load_from(&config_path).unwrap();
    assert_eq!(config.orchestrator.strategy, ParallelStrategy::Conservative);
    assert_eq!(config.projects_dir().unwrap(), state_dir);

    let store = Arc::new(JsonStateStore::new(config.projects_dir().unwrap()));
    let runner = ProjectRunner::new(
        config,
        registry(Arc::new(MockExecutor::instant())),
        store.clone(),
    );
    assert_eq!(runner.strategy(), ParallelStrategy::Conservative);

    let state = runner.start("Configured", diamond()).await.unwrap();
    assert_eq!(state.status(), ProjectStatus::Complete);
    assert!(state_dir.join(state.id.to_string()).join("state.json").exists());
}
