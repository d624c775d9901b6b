//! Execution tests.
//!
//! These tests verify that the orchestrator:
//! - Never starts a task before its dependencies have finished
//! - Runs independent groups of a stage concurrently
//! - Defers or forces groups when the resource budget is exhausted
//! - Fails whole groups on timeout or cancellation
//! - Leaves dependents of failed tasks queued

use std::sync::Arc;
use std::time::Duration;

use maos::config::{Config, OrchestratorConfig, ResourceConfig, ResourceThresholds};
use maos::core::{LogLevel, ProjectStatus, TaskStatus, Team};
use maos::orchestration::{ExecutionMode, ExecutionState, ParallelOrchestrator, ProjectRunner};
use maos::resources::ResourceManager;
use maos::state::MemoryStateStore;

use crate::fixtures::{
    chain, diamond, independent_tasks, orchestrator, project, registry, test_task, MockExecutor,
};

fn status_of(state: &maos::core::ProjectState, id: &str) -> TaskStatus {
    state.get_task(&id.into()).unwrap().status
}

/// An orchestrator whose budget refuses anything above `maximum` of each limit.
fn budgeted(executor: Arc<MockExecutor>, maximum: f64) -> ParallelOrchestrator {
    let resources = ResourceConfig {
        thresholds: ResourceThresholds {
            warning: maximum / 2.0,
            critical: maximum,
            maximum,
        },
        ..ResourceConfig::default()
    };
    ParallelOrchestrator::new(
        OrchestratorConfig::default(),
        registry(executor),
        ResourceManager::new(resources),
    )
}

// Ordering

/// Test: Parallel diamond honours dependency order
///
/// Given a diamond a -> (b, c) -> d
/// When executed in parallel mode
/// Then b and c overlap, and neither starts before a ends nor d before both end
#[tokio::test(start_paused = true)]
async fn test_parallel_diamond_stage_order() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(100)));
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(diamond());

    assert!(orch.execute(&mut state, ExecutionMode::Parallel).await);
    assert!(state.all_complete());

    let a = executor.span("a").unwrap();
    let b = executor.span("b").unwrap();
    let c = executor.span("c").unwrap();
    let d = executor.span("d").unwrap();
    assert!(b.start >= a.end);
    assert!(c.start >= a.end);
    assert!(d.start >= b.end);
    assert!(d.start >= c.end);
    assert_eq!(executor.max_concurrency(), 2);

    let metrics = orch.metrics().await.unwrap();
    assert_eq!(metrics.stages_completed, 3);
    assert_eq!(metrics.completed_tasks, 4);
    assert_eq!(metrics.max_concurrent_groups, 2);
}

/// Test: Sequential mode runs a chain in declaration order
///
/// Given a four-step chain
/// When executed sequentially
/// Then tasks run one at a time in dependency order
#[tokio::test(start_paused = true)]
async fn test_sequential_chain_order() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)));
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(chain(4));

    assert!(orch.execute(&mut state, ExecutionMode::Sequential).await);

    let calls: Vec<String> = executor.calls().iter().map(ToString::to_string).collect();
    assert_eq!(calls, vec!["t0", "t1", "t2", "t3"]);
    assert_eq!(executor.max_concurrency(), 1);
}

/// Test: Sequential fan-in waits for both inputs
///
/// Given t1 and t2 with no dependencies and t3 depending on both
/// When executed sequentially
/// Then t3 runs last and every task completes
#[tokio::test]
async fn test_sequential_fan_in() {
    let executor = Arc::new(MockExecutor::instant());
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(vec![
        test_task("t1", Team::Backend, &[]),
        test_task("t2", Team::Frontend, &[]),
        test_task("t3", Team::Qa, &["t1", "t2"]),
    ]);

    assert!(orch.execute(&mut state, ExecutionMode::Sequential).await);

    assert!(state.all_complete());
    let calls = executor.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].as_str(), "t3");
}

/// Test: Hybrid mode falls back to sequential for a chain
///
/// Given a chain with no parallelism
/// When executed in hybrid mode
/// Then every task completes and no two run at once
#[tokio::test(start_paused = true)]
async fn test_hybrid_chain_is_sequential() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(10)));
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(chain(5));

    assert!(orch.execute(&mut state, ExecutionMode::Hybrid).await);
    assert_eq!(executor.call_count(), 5);
    assert_eq!(executor.max_concurrency(), 1);
}

/// Test: Hybrid mode runs wide task sets in parallel
///
/// Given six independent tasks on different teams
/// When executed in hybrid mode
/// Then more than one group runs at the same time
#[tokio::test(start_paused = true)]
async fn test_hybrid_wide_set_is_parallel() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(50)));
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(independent_tasks(6));

    assert!(orch.execute(&mut state, ExecutionMode::Hybrid).await);
    assert!(executor.max_concurrency() > 1);
}

// Failures

/// Test: A failed task blocks its dependents
///
/// Given a diamond where b fails
/// When executed in parallel mode
/// Then c still completes, d stays queued, and the run reports failure
#[tokio::test]
async fn test_failure_blocks_dependents() {
    let executor = Arc::new(MockExecutor::instant().failing(["b"]));
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(diamond());

    assert!(!orch.execute(&mut state, ExecutionMode::Parallel).await);

    assert_eq!(status_of(&state, "a"), TaskStatus::Complete);
    assert_eq!(status_of(&state, "b"), TaskStatus::Failed);
    assert_eq!(status_of(&state, "c"), TaskStatus::Complete);
    assert_eq!(status_of(&state, "d"), TaskStatus::Queued);
    assert_eq!(
        state.get_task(&"b".into()).unwrap().error.as_deref(),
        Some("b failed")
    );
    assert!(state
        .logs()
        .iter()
        .any(|e| e.message == "Stage 2 failed, stopping execution"));
    assert!(executor.span("d").is_none());
}

/// Test: A slow group times out as a whole
///
/// Given a group timeout of one second and an executor that takes five
/// When the group runs
/// Then its task fails with a timeout message
#[tokio::test(start_paused = true)]
async fn test_group_timeout() {
    let executor = Arc::new(MockExecutor::new(Duration::from_secs(5)));
    let config = OrchestratorConfig {
        group_timeout_secs: 1,
        ..OrchestratorConfig::default()
    };
    let orch = orchestrator(executor, config);
    let mut state = project(vec![test_task("slow", Team::Research, &[])]);

    assert!(!orch.execute(&mut state, ExecutionMode::Parallel).await);

    let task = state.get_task(&"slow".into()).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("timed out after 1s"));
    assert_eq!(orch.status().await.failed_groups, 1);
}

/// Test: Unknown dependencies are dropped with a warning
///
/// Given a task that depends on a real task and on an id not in the project
/// When the project is executed
/// Then the unknown dependency is removed with a warning and the task runs
/// after its real dependency
#[tokio::test]
async fn test_dangling_dependency_dropped() {
    let executor = Arc::new(MockExecutor::instant());
    let orch = orchestrator(executor.clone(), OrchestratorConfig::default());
    let mut state = project(vec![
        test_task("base", Team::Research, &[]),
        test_task("real", Team::Backend, &["ghost", "base"]),
    ]);

    assert!(orch.execute(&mut state, ExecutionMode::Parallel).await);

    let deps: Vec<String> = state
        .get_task(&"real".into())
        .unwrap()
        .dependencies
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(deps, vec!["base"]);
    assert!(state
        .logs()
        .iter()
        .any(|e| e.level == LogLevel::Warning && e.message.contains("ghost")));
    let calls: Vec<String> = executor.calls().iter().map(ToString::to_string).collect();
    assert_eq!(calls, vec!["base", "real"]);
}

// Resource budget

/// Test: Groups that do not fit the budget wait for the next wave
///
/// Given two independent groups that together exceed half the token limit
/// When executed with a maximum threshold of 0.5
/// Then they run one after another and both complete
#[tokio::test(start_paused = true)]
async fn test_budget_defers_second_group() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(100)));
    let orch = budgeted(executor.clone(), 0.5);
    let mut state = project(vec![
        test_task("fe", Team::Frontend, &[]),
        test_task("be", Team::Backend, &[]),
    ]);

    assert!(orch.execute(&mut state, ExecutionMode::Parallel).await);

    assert_eq!(executor.max_concurrency(), 1);
    let metrics = orch.metrics().await.unwrap();
    assert_eq!(metrics.max_concurrent_groups, 1);
    assert_eq!(metrics.stages_completed, 1);

    let status = orch.resources().status().await;
    assert!(status.refused_allocations >= 1);
    assert_eq!(status.forced_allocations, 0);
    assert_eq!(status.active_allocations, 0);
}

/// Test: The budget never stalls a stage
///
/// Given a budget so small no group fits
/// When executed in parallel mode
/// Then each group is forced through alone and the run still succeeds
#[tokio::test(start_paused = true)]
async fn test_budget_forces_progress() {
    let executor = Arc::new(MockExecutor::new(Duration::from_millis(100)));
    let orch = budgeted(executor.clone(), 0.2);
    let mut state = project(vec![
        test_task("fe", Team::Frontend, &[]),
        test_task("be", Team::Backend, &[]),
    ]);

    assert!(orch.execute(&mut state, ExecutionMode::Parallel).await);

    assert!(state.all_complete());
    assert_eq!(executor.max_concurrency(), 1);
    let status = orch.resources().status().await;
    assert_eq!(status.forced_allocations, 2);
    assert_eq!(status.active_allocations, 0);
}

// Cancellation

/// Test: Cancelling a runner fails the in-flight group and stops the run
///
/// Given a diamond whose tasks take a minute each
/// When the run is cancelled one second in
/// Then a fails as cancelled, nothing later starts, and the project fails
#[tokio::test(start_paused = true)]
async fn test_cancel_running_project() {
    let executor = Arc::new(MockExecutor::new(Duration::from_secs(60)));
    let store = Arc::new(MemoryStateStore::new());
    let runner = ProjectRunner::new(Config::default(), registry(executor.clone()), store)
        .with_mode(ExecutionMode::Parallel);
    let handle = runner.cancel_handle();

    let (result, _) = tokio::join!(runner.start("Cancelled project", diamond()), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel().await;
    });

    let state = result.unwrap();
    assert_eq!(state.status(), ProjectStatus::Failed);
    assert_eq!(status_of(&state, "a"), TaskStatus::Failed);
    assert_eq!(
        state.get_task(&"a".into()).unwrap().error.as_deref(),
        Some("cancelled")
    );
    for id in ["b", "c", "d"] {
        assert_eq!(status_of(&state, id), TaskStatus::Queued);
    }
    assert_eq!(executor.call_count(), 1);
    assert_eq!(handle.active_groups(), 0);
    assert_eq!(runner.execution_status().await.state, ExecutionState::Completed);
}
