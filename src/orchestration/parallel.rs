//! Parallel execution engine.
//!
//! The orchestrator walks a [`ParallelExecutionPlan`] stage by stage. Groups
//! in a stage run concurrently on the calling task (no spawning), each under
//! its own timeout, and their outcomes are folded back into the
//! [`ProjectState`] only after every group in the wave has settled. The
//! project is therefore only mutated between awaits.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{OrchestratorConfig, ResourceLimits};
use crate::core::{LogLevel, ProjectState, Task, TaskId, TaskStatus};
use crate::orchestration::analyzer::{
    DependencyAnalyzer, GroupId, ParallelExecutionPlan, TaskGroup,
};
use crate::orchestration::estimate;
use crate::orchestration::executor::{ExecutionOutcome, Executor, ExecutorRegistry};
use crate::orchestration::status::{ExecutionMetrics, ExecutionState, ExecutionStatus};
use crate::orchestration::strategy::{ExecutionMode, ParallelStrategy};
use crate::resources::{ResourceManager, ResourceVector};
use crate::state::StateStore;
use crate::util::human_duration;

const LOG_SOURCE: &str = "parallel_orchestrator";
const CANCELLED: &str = "cancelled";

/// Bookkeeping shared with [`CancelHandle`]s.
struct Shared {
    tracker: Mutex<Tracker>,
    active: watch::Sender<usize>,
}

#[derive(Default)]
struct Tracker {
    cancel: CancellationToken,
    running: bool,
    metrics: Option<ExecutionMetrics>,
    completed_groups: HashSet<GroupId>,
    failed_groups: HashSet<GroupId>,
}

/// Counts one group (or one sequential task) as active until its outcome
/// has been written back to the project.
struct ActiveGroup<'a>(&'a watch::Sender<usize>);

impl<'a> ActiveGroup<'a> {
    fn enter(counter: &'a watch::Sender<usize>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter)
    }
}

impl Drop for ActiveGroup<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Cancels a running [`ParallelOrchestrator::execute`] from elsewhere.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Cancel the current run and wait until no group is active.
    ///
    /// In-flight groups fail all their tasks with "cancelled", and a task
    /// running in sequential mode fails the same way; both are recorded on
    /// the project before this returns. Later work is not started. Cancelling while nothing runs returns at once; the
    /// next `execute` starts with a fresh token.
    pub async fn cancel(&self) {
        info!("Cancelling parallel execution");
        let token = self.shared.tracker.lock().await.cancel.clone();
        token.cancel();
        let mut active = self.shared.active.subscribe();
        if active.wait_for(|n| *n == 0).await.is_err() {
            warn!("Orchestrator dropped while waiting for cancellation");
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        self.shared.tracker.lock().await.cancel.is_cancelled()
    }

    /// Number of groups, or sequential tasks, currently executing.
    pub fn active_groups(&self) -> usize {
        *self.shared.active.borrow()
    }
}

/// Result of running one task through an executor.
enum TaskRun {
    Finished(ExecutionOutcome),
    Cancelled,
}

enum GroupOutcome {
    Finished(Vec<(TaskId, ExecutionOutcome)>),
    TimedOut(Duration),
    Cancelled,
    Unassigned(String),
}

struct GroupRun {
    id: GroupId,
    outcome: GroupOutcome,
    agent: String,
    elapsed: Duration,
}

/// Executes projects sequentially, in parallel stages, or picks between
/// the two.
pub struct ParallelOrchestrator {
    config: OrchestratorConfig,
    analyzer: DependencyAnalyzer,
    registry: ExecutorRegistry,
    resources: ResourceManager,
    store: Option<Arc<dyn StateStore>>,
    shared: Arc<Shared>,
}

impl ParallelOrchestrator {
    /// # Arguments
    ///
    /// * `config` - Strategy, timeouts and iteration caps
    /// * `registry` - Executors by team
    /// * `resources` - Shared budget consulted before each group launches
    pub fn new(
        config: OrchestratorConfig,
        registry: ExecutorRegistry,
        resources: ResourceManager,
    ) -> Self {
        info!(strategy = %config.strategy, "Parallel orchestrator initialized");
        let (active, _) = watch::channel(0usize);
        Self {
            analyzer: DependencyAnalyzer::new(config.strategy),
            config,
            registry,
            resources,
            store: None,
            shared: Arc::new(Shared {
                tracker: Mutex::new(Tracker::default()),
                active,
            }),
        }
    }

    /// Persist the project after every state change.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn strategy(&self) -> ParallelStrategy {
        self.analyzer.strategy()
    }

    pub fn set_strategy(&mut self, strategy: ParallelStrategy) {
        info!(from = %self.analyzer.strategy(), to = %strategy, "Parallel strategy changed");
        self.config.strategy = strategy;
        self.analyzer.set_strategy(strategy);
    }

    pub fn analyzer(&self) -> &DependencyAnalyzer {
        &self.analyzer
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Metrics of the current or most recent run.
    pub async fn metrics(&self) -> Option<ExecutionMetrics> {
        self.shared.tracker.lock().await.metrics.clone()
    }

    pub async fn status(&self) -> ExecutionStatus {
        let tracker = self.shared.tracker.lock().await;
        let Some(metrics) = &tracker.metrics else {
            return ExecutionStatus::not_started();
        };
        ExecutionStatus {
            state: if tracker.running {
                ExecutionState::Running
            } else {
                ExecutionState::Completed
            },
            total_tasks: metrics.total_tasks,
            completed_tasks: metrics.completed_tasks,
            failed_tasks: metrics.failed_tasks,
            completion_rate: metrics.completion_rate(),
            elapsed: metrics.elapsed(),
            active_groups: *self.shared.active.borrow(),
            completed_groups: tracker.completed_groups.len(),
            failed_groups: tracker.failed_groups.len(),
            stages_completed: metrics.stages_completed,
            max_concurrent_groups: metrics.max_concurrent_groups,
            resource_high_water: metrics.resource_high_water,
            estimated_speedup: metrics.speedup(self.config.assumed_minutes_per_task),
        }
    }

    /// Run the project's queued tasks.
    ///
    /// Returns `true` only if every task in the project ends `Complete`.
    /// Executor errors, timeouts and persistence failures never escape;
    /// they are recorded on the tasks and in the project log.
    pub async fn execute(&self, state: &mut ProjectState, mode: ExecutionMode) -> bool {
        info!(project = %state.id.short(), %mode, "Starting execution");

        let cancel = {
            let mut tracker = self.shared.tracker.lock().await;
            tracker.cancel = CancellationToken::new();
            tracker.running = true;
            let pending = state.tasks().iter().filter(|t| !t.is_finished()).count();
            tracker.metrics = Some(ExecutionMetrics::start(pending));
            tracker.completed_groups.clear();
            tracker.failed_groups.clear();
            tracker.cancel.clone()
        };

        if !state.prune_dangling_dependencies().is_empty() {
            self.persist(state).await;
        }

        let success = match mode {
            ExecutionMode::Sequential => self.execute_sequential(state, &cancel).await,
            ExecutionMode::Parallel => self.execute_parallel(state, &cancel).await,
            ExecutionMode::Hybrid => self.execute_hybrid(state, &cancel).await,
        };

        let mut tracker = self.shared.tracker.lock().await;
        tracker.running = false;
        if let Some(metrics) = tracker.metrics.as_mut() {
            metrics.finished_at = Some(chrono::Utc::now());
            log_summary(metrics, self.config.assumed_minutes_per_task);
        }
        success
    }

    async fn execute_hybrid(&self, state: &mut ProjectState, cancel: &CancellationToken) -> bool {
        let runnable: Vec<Task> = state.runnable_tasks().into_iter().cloned().collect();
        let summary = match self.analyzer.parallelism_opportunities(&runnable) {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Planning failed");
                state.add_log_entry(LogLevel::Error, LOG_SOURCE, format!("Planning failed: {}", e));
                self.persist(state).await;
                return false;
            }
        };

        if summary.parallelism_factor > self.config.hybrid_threshold {
            info!(
                factor = summary.parallelism_factor,
                "Good parallelism opportunities, using parallel execution"
            );
            self.execute_parallel(state, cancel).await
        } else {
            info!(
                factor = summary.parallelism_factor,
                "Limited parallelism opportunities, using sequential execution"
            );
            self.execute_sequential(state, cancel).await
        }
    }

    async fn execute_sequential(&self, state: &mut ProjectState, cancel: &CancellationToken) -> bool {
        info!("Using sequential execution mode");
        let mut iterations = 0;

        loop {
            if cancel.is_cancelled() {
                self.log_cancelled(state).await;
                return false;
            }

            let next = state.ready_tasks().first().map(|t| (*t).clone());
            let Some(task) = next else {
                if state.all_finished() {
                    break;
                }
                let blocked = state.blocked_tasks().len();
                let message = if blocked > 0 {
                    format!("{} tasks blocked by failed dependencies", blocked)
                } else {
                    "Dependency deadlock: no task is ready but the project is not finished"
                        .to_string()
                };
                error!("{}", message);
                state.add_log_entry(LogLevel::Error, LOG_SOURCE, message);
                self.persist(state).await;
                return false;
            };

            if iterations >= self.config.max_iterations {
                error!(max = self.config.max_iterations, "Maximum task execution iterations reached");
                state.add_log_entry(
                    LogLevel::Error,
                    LOG_SOURCE,
                    format!("Maximum of {} iterations reached", self.config.max_iterations),
                );
                self.persist(state).await;
                return false;
            }
            iterations += 1;

            info!(task = %task.id, "Executing task: {}", task.description);
            if let Err(e) = state.update_task_status(&task.id, TaskStatus::InProgress, None) {
                warn!(task = %task.id, error = %e, "Could not start task");
                continue;
            }
            self.persist(state).await;

            let active = ActiveGroup::enter(&self.shared.active);
            let (agent, run) = match self.registry.resolve(task.team) {
                Ok(executor) => {
                    let run = run_task(executor.as_ref(), &task, cancel).await;
                    (executor.name().to_string(), run)
                }
                Err(e) => (
                    String::new(),
                    TaskRun::Finished(ExecutionOutcome::failure(e.to_string())),
                ),
            };

            match run {
                TaskRun::Finished(outcome) => {
                    let completed = outcome.success;
                    apply_outcome(state, &task, &agent, outcome);
                    self.record_task(completed).await;
                }
                TaskRun::Cancelled => {
                    fail_task(state, &task.id, CANCELLED);
                    self.record_task(false).await;
                }
            }
            self.persist(state).await;
            drop(active);
        }

        state.all_complete()
    }

    async fn execute_parallel(&self, state: &mut ProjectState, cancel: &CancellationToken) -> bool {
        let blocked: Vec<TaskId> = state.blocked_tasks().iter().map(|t| t.id.clone()).collect();
        if !blocked.is_empty() {
            warn!(count = blocked.len(), "Tasks blocked by failed dependencies stay queued");
            state.add_log_entry(
                LogLevel::Warning,
                LOG_SOURCE,
                format!("{} tasks blocked by failed dependencies", blocked.len()),
            );
        }

        let runnable: Vec<Task> = state.runnable_tasks().into_iter().cloned().collect();
        let waiting = state
            .status_counts()
            .queued
            .saturating_sub(blocked.len() + runnable.len());
        if waiting > 0 {
            warn!(count = waiting, "Tasks waiting on unfinished dependencies stay queued");
            state.add_log_entry(
                LogLevel::Warning,
                LOG_SOURCE,
                format!("{} tasks waiting on unfinished dependencies", waiting),
            );
        }
        if runnable.is_empty() {
            warn!("No runnable tasks found for parallel execution");
            return state.all_complete();
        }

        let plan = match self.analyzer.analyze(&runnable) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Planning failed");
                state.add_log_entry(LogLevel::Error, LOG_SOURCE, format!("Planning failed: {}", e));
                self.persist(state).await;
                return false;
            }
        };

        state.add_log_entry(
            LogLevel::Info,
            LOG_SOURCE,
            format!(
                "Created parallel execution plan: {} groups, {} stages",
                plan.groups.len(),
                plan.stages.len()
            ),
        );
        self.persist(state).await;

        let stage_count = plan.stages.len();
        for stage in 0..stage_count {
            if cancel.is_cancelled() {
                self.log_cancelled(state).await;
                return false;
            }

            let groups = plan.stage_groups(stage);
            info!(
                stage = stage + 1,
                of = stage_count,
                groups = groups.len(),
                "Executing stage"
            );

            let stage_ok = self.execute_stage(&plan, groups, state, cancel).await;
            if cancel.is_cancelled() {
                self.log_cancelled(state).await;
                return false;
            }
            if !stage_ok {
                error!(stage = stage + 1, "Stage failed, stopping execution");
                state.add_log_entry(
                    LogLevel::Error,
                    LOG_SOURCE,
                    format!("Stage {} failed, stopping execution", stage + 1),
                );
                self.persist(state).await;
                return false;
            }

            if let Some(metrics) = self.shared.tracker.lock().await.metrics.as_mut() {
                metrics.stages_completed += 1;
            }
        }

        let success = state.all_complete();
        if success {
            info!("All parallel task groups completed successfully");
        } else {
            warn!("Parallel execution finished with incomplete tasks");
        }
        success
    }

    /// Run one stage in resource-gated waves. Returns false if any group
    /// failed.
    async fn execute_stage(
        &self,
        plan: &ParallelExecutionPlan,
        groups: Vec<&TaskGroup>,
        state: &mut ProjectState,
        cancel: &CancellationToken,
    ) -> bool {
        let limits = self.resources.limits().await;
        let mut pending: Vec<&TaskGroup> = groups;
        let mut stage_ok = true;

        while !pending.is_empty() && !cancel.is_cancelled() {
            let mut wave: Vec<&TaskGroup> = Vec::new();
            let mut waiting: Vec<&TaskGroup> = Vec::new();
            for group in pending {
                let key = allocation_key(state, group.id);
                let request = group.resources.to_absolute(&limits);
                if self.resources.try_allocate(&key, request, false).await {
                    wave.push(group);
                } else {
                    debug!(group = %group.id, "Group deferred to next wave");
                    waiting.push(group);
                }
            }
            if wave.is_empty() {
                let group = waiting.remove(0);
                warn!(group = %group.id, "No group fits the budget; forcing allocation");
                let key = allocation_key(state, group.id);
                self.resources
                    .try_allocate(&key, group.resources.to_absolute(&limits), true)
                    .await;
                wave.push(group);
            }
            pending = waiting;

            for group in &wave {
                for task in &group.tasks {
                    if let Err(e) = state.update_task_status(&task.id, TaskStatus::InProgress, None)
                    {
                        warn!(task = %task.id, error = %e, "Could not start task");
                    }
                }
            }
            self.persist(state).await;
            self.record_wave(&wave).await;

            let active: Vec<ActiveGroup<'_>> = wave
                .iter()
                .map(|_| ActiveGroup::enter(&self.shared.active))
                .collect();
            let runs = join_all(wave.iter().map(|group| self.run_group(group, cancel))).await;

            for run in runs {
                let Some(group) = plan.group(run.id) else {
                    continue;
                };
                let ok = self.settle_group(state, group, run, &limits).await;
                stage_ok &= ok;
            }
            self.persist(state).await;
            drop(active);
        }

        stage_ok
    }

    /// Execute a group's tasks in order under the group timeout.
    async fn run_group(&self, group: &TaskGroup, cancel: &CancellationToken) -> GroupRun {
        let started = Instant::now();
        info!(group = %group.id, team = %group.team, tasks = group.len(), "Starting group");

        let executor = match self.registry.resolve(group.team) {
            Ok(executor) => executor,
            Err(e) => {
                return GroupRun {
                    id: group.id,
                    outcome: GroupOutcome::Unassigned(e.to_string()),
                    agent: String::new(),
                    elapsed: started.elapsed(),
                }
            }
        };
        let agent = executor.name().to_string();
        let limit = self.config.group_timeout();

        let work = async {
            let mut outcomes = Vec::with_capacity(group.len());
            for task in &group.tasks {
                match run_task(executor.as_ref(), task, cancel).await {
                    TaskRun::Finished(outcome) => outcomes.push((task.id.clone(), outcome)),
                    TaskRun::Cancelled => return GroupOutcome::Cancelled,
                }
            }
            GroupOutcome::Finished(outcomes)
        };

        let outcome = match tokio::time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(group = %group.id, timeout = %human_duration(limit), "Group timed out");
                GroupOutcome::TimedOut(limit)
            }
        };

        GroupRun {
            id: group.id,
            outcome,
            agent,
            elapsed: started.elapsed(),
        }
    }

    /// Fold a group's outcome into the project and release its budget.
    async fn settle_group(
        &self,
        state: &mut ProjectState,
        group: &TaskGroup,
        run: GroupRun,
        limits: &ResourceLimits,
    ) -> bool {
        let mut completed = 0;
        let mut failed = 0;
        let mut tokens = 0;

        match run.outcome {
            GroupOutcome::Finished(outcomes) => {
                for (task_id, outcome) in outcomes {
                    let Some(task) = group.tasks.iter().find(|t| t.id == task_id) else {
                        continue;
                    };
                    tokens += outcome.tokens_used;
                    if outcome.success {
                        completed += 1;
                    } else {
                        failed += 1;
                    }
                    apply_outcome(state, task, &run.agent, outcome);
                }
            }
            GroupOutcome::TimedOut(limit) => {
                let message = format!("timed out after {}", human_duration(limit));
                for task in &group.tasks {
                    fail_task(state, &task.id, &message);
                }
                failed = group.len();
            }
            GroupOutcome::Cancelled => {
                for task in &group.tasks {
                    fail_task(state, &task.id, CANCELLED);
                }
                failed = group.len();
            }
            GroupOutcome::Unassigned(message) => {
                for task in &group.tasks {
                    fail_task(state, &task.id, &message);
                }
                failed = group.len();
            }
        }

        let key = allocation_key(state, group.id);
        let mut used = estimate::group_usage(group.tasks.iter()).to_absolute(limits);
        if tokens > 0 {
            used.tokens = tokens as f64;
        }
        self.resources.update_usage(&key, used).await;
        self.resources.release(&key).await;

        let success = failed == 0;
        if success {
            info!(group = %group.id, elapsed = ?run.elapsed, "Group completed successfully");
        } else {
            error!(group = %group.id, failed, "Group failed");
        }

        let mut tracker = self.shared.tracker.lock().await;
        if success {
            tracker.completed_groups.insert(group.id);
        } else {
            tracker.failed_groups.insert(group.id);
        }
        if let Some(metrics) = tracker.metrics.as_mut() {
            metrics.completed_tasks += completed;
            metrics.failed_tasks += failed;
            metrics.groups_executed += 1;
        }
        success
    }

    async fn record_wave(&self, wave: &[&TaskGroup]) {
        let footprint: ResourceVector = wave.iter().map(|g| g.resources).sum();
        if let Some(metrics) = self.shared.tracker.lock().await.metrics.as_mut() {
            metrics.max_concurrent_groups = metrics.max_concurrent_groups.max(wave.len());
            metrics.resource_high_water = metrics.resource_high_water.max(&footprint);
        }
    }

    async fn record_task(&self, completed: bool) {
        if let Some(metrics) = self.shared.tracker.lock().await.metrics.as_mut() {
            if completed {
                metrics.completed_tasks += 1;
            } else {
                metrics.failed_tasks += 1;
            }
        }
    }

    async fn log_cancelled(&self, state: &mut ProjectState) {
        warn!("Execution cancelled");
        state.add_log_entry(LogLevel::Warning, LOG_SOURCE, "Execution cancelled");
        self.persist(state).await;
    }

    async fn persist(&self, state: &ProjectState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(state).await {
                warn!(project = %state.id.short(), error = %e, "Failed to persist project state");
            }
        }
    }
}

fn allocation_key(state: &ProjectState, group: GroupId) -> String {
    format!("{}/{}", state.id.short(), group)
}

/// Run one task, racing the executor against cancellation.
async fn run_task(executor: &dyn Executor, task: &Task, cancel: &CancellationToken) -> TaskRun {
    tokio::select! {
        _ = cancel.cancelled() => TaskRun::Cancelled,
        result = executor.execute(task) => match result {
            Ok(outcome) => TaskRun::Finished(outcome),
            Err(e) => {
                warn!(task = %task.id, error = %e, "Executor returned an error");
                TaskRun::Finished(ExecutionOutcome::failure(e.to_string()))
            }
        },
    }
}

fn apply_outcome(state: &mut ProjectState, task: &Task, agent: &str, outcome: ExecutionOutcome) {
    if !agent.is_empty() {
        state.record_agent_usage(agent, task.team, outcome.tokens_used);
    }
    if outcome.success {
        for artifact in &outcome.artifacts {
            if let Err(e) = state.append_artifact(&task.id, artifact) {
                warn!(task = %task.id, error = %e, "Could not record artifact");
            }
        }
        if let Err(e) = state.update_task_status(&task.id, TaskStatus::Complete, None) {
            warn!(task = %task.id, error = %e, "Could not complete task");
        }
        debug!(task = %task.id, "Task completed");
    } else {
        let message = outcome
            .error
            .unwrap_or_else(|| "Task execution failed".to_string());
        fail_task(state, &task.id, &message);
    }
}

fn fail_task(state: &mut ProjectState, id: &TaskId, message: &str) {
    if let Err(e) = state.update_task_status(id, TaskStatus::Failed, Some(message)) {
        warn!(task = %id, error = %e, "Could not fail task");
    }
}

fn log_summary(metrics: &ExecutionMetrics, minutes_per_task: f64) {
    info!(
        total = metrics.total_tasks,
        completed = metrics.completed_tasks,
        failed = metrics.failed_tasks,
        completion_rate = %format!("{:.1}%", metrics.completion_rate()),
        elapsed = %human_duration(metrics.elapsed()),
        stages = metrics.stages_completed,
        max_concurrent_groups = metrics.max_concurrent_groups,
        speedup = %format!("{:.1}x", metrics.speedup(minutes_per_task)),
        "Execution finished"
    );
}
