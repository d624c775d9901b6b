//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Mock executors that record, delay or fail work
//! - Predefined task sets
//! - Orchestrators and runners wired to the mocks

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use maos::config::{OrchestratorConfig, ResourceConfig};
use maos::core::{ProjectState, Task, TaskId, Team};
use maos::orchestration::{ExecutionOutcome, Executor, ExecutorRegistry, ParallelOrchestrator};
use maos::resources::ResourceManager;
use maos::Result;

/// When a task started and finished on the tokio clock.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub start: Instant,
    pub end: Instant,
}

/// An executor that sleeps, optionally fails, and records what it saw.
pub struct MockExecutor {
    delay: Duration,
    fail: HashSet<String>,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    calls: Mutex<Vec<TaskId>>,
    spans: Mutex<HashMap<TaskId, Span>>,
}

impl MockExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: HashSet::new(),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            spans: Mutex::new(HashMap::new()),
        }
    }

    /// An executor that completes everything immediately.
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Fail tasks with any of these ids.
    pub fn failing<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fail.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Task ids in the order execution started.
    pub fn calls(&self) -> Vec<TaskId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of tasks this executor ran at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn span(&self, id: &str) -> Option<Span> {
        self.spans.lock().unwrap().get(&TaskId::new(id)).copied()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, task: &Task) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        self.calls.lock().unwrap().push(task.id.clone());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().unwrap().insert(
            task.id.clone(),
            Span {
                start,
                end: Instant::now(),
            },
        );

        if self.fail.contains(task.id.as_str()) {
            return Ok(ExecutionOutcome::failure(format!("{} failed", task.id)));
        }
        Ok(ExecutionOutcome::success()
            .with_artifact(format!("artifact://{}", task.id))
            .with_tokens(100))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Create a task with the given team and dependencies.
pub fn test_task(id: &str, team: Team, deps: &[&str]) -> Task {
    Task::new(id, &format!("Work on {}", id), team).depends_on(deps.iter().copied())
}

/// a -> (b, c) -> d, with b and c on different teams.
pub fn diamond() -> Vec<Task> {
    vec![
        test_task("a", Team::Research, &[]),
        test_task("b", Team::Backend, &["a"]),
        test_task("c", Team::Frontend, &["a"]),
        test_task("d", Team::Qa, &["b", "c"]),
    ]
}

/// t0 -> t1 -> ... -> t{n-1}.
pub fn chain(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            let id = format!("t{}", i);
            let task = Task::new(id.as_str(), &format!("Step {}", i), Team::General);
            if i == 0 {
                task
            } else {
                task.depends_on([format!("t{}", i - 1)])
            }
        })
        .collect()
}

/// `n` tasks with no dependencies, cycling through every team.
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            let team = Team::ALL[i % Team::ALL.len()];
            Task::new(format!("w{}", i), &format!("Independent item {}", i), team)
        })
        .collect()
}

/// A project holding `tasks`.
pub fn project(tasks: Vec<Task>) -> ProjectState {
    let mut state = ProjectState::new("Integration test project");
    for task in tasks {
        state.add_task(task).unwrap();
    }
    state
}

pub fn registry(executor: Arc<MockExecutor>) -> ExecutorRegistry {
    ExecutorRegistry::with_fallback(executor)
}

/// An orchestrator with default resources sending every team to `executor`.
pub fn orchestrator(executor: Arc<MockExecutor>, config: OrchestratorConfig) -> ParallelOrchestrator {
    ParallelOrchestrator::new(
        config,
        registry(executor),
        ResourceManager::new(ResourceConfig::default()),
    )
}
