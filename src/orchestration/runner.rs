//! Project lifecycle driver.
//!
//! The runner owns nothing long-lived but the orchestrator and a store. Each
//! call loads or creates a [`ProjectState`], walks it through
//! `Planning -> Executing -> Complete | Failed`, and saves it at every step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::{
    LogLevel, ProjectId, ProjectState, ProjectStatus, ProjectSummary, StatusCounts, Task,
    TaskStatus, Team,
};
use crate::orchestration::executor::ExecutorRegistry;
use crate::orchestration::parallel::{CancelHandle, ParallelOrchestrator};
use crate::orchestration::status::ExecutionStatus;
use crate::orchestration::strategy::{ExecutionMode, ParallelStrategy};
use crate::resources::{start_monitoring, ResourceManager};
use crate::state::StateStore;
use crate::{Error, Result};

const LOG_SOURCE: &str = "orchestrator";
const INTERRUPTED: &str = "interrupted before completion";

/// Below this completion rate (percent) `optimize` backs off one strategy.
const LOW_COMPLETION_RATE: f64 = 80.0;
/// Below this speedup `optimize` steps up one strategy.
const LOW_SPEEDUP: f64 = 1.2;

/// What the runner can do right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelCapabilities {
    pub current_strategy: ParallelStrategy,
    pub available_strategies: Vec<ParallelStrategy>,
    pub mode: ExecutionMode,
    pub max_group_size: usize,
    pub max_concurrent_groups: usize,
    pub optimal_concurrency: usize,
    pub resource_monitoring: bool,
}

/// Changes made (or suggested) by [`ProjectRunner::optimize`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub applied: Vec<String>,
    pub suggestions: Vec<String>,
}

pub struct ProjectRunner {
    config: Config,
    orchestrator: ParallelOrchestrator,
    store: Arc<dyn StateStore>,
    mode: ExecutionMode,
}

impl ProjectRunner {
    /// Build a runner with a fresh resource manager from `config`.
    pub fn new(config: Config, registry: ExecutorRegistry, store: Arc<dyn StateStore>) -> Self {
        let resources = ResourceManager::new(config.resources.clone());
        Self::with_resources(config, registry, resources, store)
    }

    /// Build a runner around an existing resource manager, e.g. one with a
    /// telemetry source attached.
    pub fn with_resources(
        config: Config,
        registry: ExecutorRegistry,
        resources: ResourceManager,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let orchestrator = ParallelOrchestrator::new(config.orchestrator.clone(), registry, resources)
            .with_store(Arc::clone(&store));
        Self {
            config,
            orchestrator,
            store,
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn orchestrator(&self) -> &ParallelOrchestrator {
        &self.orchestrator
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.orchestrator.cancel_handle()
    }

    pub async fn execution_status(&self) -> ExecutionStatus {
        self.orchestrator.status().await
    }

    /// Create a project from `tasks` and run it to a terminal status.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTaskId` if two tasks share an id; the project
    /// is saved as `Failed` in that case. Execution failures are not errors;
    /// inspect the returned state's status.
    pub async fn start(&self, objective: &str, tasks: Vec<Task>) -> Result<ProjectState> {
        info!(objective, tasks = tasks.len(), "Starting new project");
        let mut state = ProjectState::new(objective);
        state.add_log_entry(LogLevel::Info, LOG_SOURCE, "Project planning started");
        self.save(&state).await;

        for task in tasks {
            if let Err(e) = state.add_task(task) {
                error!(project = %state.id.short(), error = %e, "Project planning failed");
                state.add_log_entry(
                    LogLevel::Error,
                    LOG_SOURCE,
                    format!("Project failed with error: {}", e),
                );
                state.set_status(ProjectStatus::Failed);
                self.save(&state).await;
                return Err(e);
            }
        }

        self.run(&mut state).await;
        Ok(state)
    }

    /// Continue a stored project that has not reached a terminal status.
    ///
    /// Tasks left `InProgress` by an interrupted run are failed, since a
    /// task cannot go back to `Queued`.
    ///
    /// # Errors
    /// Returns `Error::ProjectNotFound` for an unknown id and
    /// `Error::Validation` if the project is already complete or failed.
    pub async fn resume(&self, id: &ProjectId) -> Result<ProjectState> {
        info!(project = %id.short(), "Resuming project");
        let mut state = self.store.load(id).await?;
        if state.is_terminal() {
            return Err(Error::Validation(format!(
                "Cannot resume project {} with status {}",
                id,
                state.status()
            )));
        }

        let stale: Vec<_> = state
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        for task in &stale {
            warn!(task = %task, "Failing task interrupted by a previous run");
            state.update_task_status(task, TaskStatus::Failed, Some(INTERRUPTED))?;
        }

        state.add_log_entry(LogLevel::Info, LOG_SOURCE, "Project resumed");
        self.run(&mut state).await;
        Ok(state)
    }

    async fn run(&self, state: &mut ProjectState) -> bool {
        state.set_status(ProjectStatus::Executing);
        state.add_log_entry(LogLevel::Info, LOG_SOURCE, "Project execution started");
        self.save(state).await;

        let monitor = start_monitoring(
            self.orchestrator.resources().clone(),
            self.config.resources.monitoring_interval(),
        );
        let success = self.orchestrator.execute(state, self.mode).await;
        monitor.stop().await;

        if success {
            state.set_status(ProjectStatus::Complete);
            state.add_log_entry(LogLevel::Info, LOG_SOURCE, "Project completed successfully");
        } else {
            state.set_status(ProjectStatus::Failed);
            state.add_log_entry(LogLevel::Error, LOG_SOURCE, "Project failed to complete");
        }
        self.save(state).await;
        info!(project = %state.id.short(), status = %state.status(), "Project finished");
        success
    }

    async fn save(&self, state: &ProjectState) {
        if let Err(e) = self.store.save(state).await {
            warn!(project = %state.id.short(), error = %e, "Failed to save project state");
        }
    }

    pub async fn status(&self, id: &ProjectId) -> Result<ProjectSummary> {
        Ok(self.store.load(id).await?.summary())
    }

    pub async fn team_status(&self, id: &ProjectId) -> Result<BTreeMap<Team, StatusCounts>> {
        Ok(self.store.load(id).await?.team_status())
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectSummary>> {
        self.store.list().await
    }

    pub fn strategy(&self) -> ParallelStrategy {
        self.orchestrator.strategy()
    }

    pub fn set_strategy(&mut self, strategy: ParallelStrategy) {
        self.config.orchestrator.strategy = strategy;
        self.orchestrator.set_strategy(strategy);
    }

    pub async fn parallel_capabilities(&self) -> ParallelCapabilities {
        let strategy = self.strategy();
        ParallelCapabilities {
            current_strategy: strategy,
            available_strategies: ParallelStrategy::ALL.to_vec(),
            mode: self.mode,
            max_group_size: strategy.max_group_size(),
            max_concurrent_groups: strategy.max_concurrent_groups(),
            optimal_concurrency: self.orchestrator.resources().optimal_concurrency().await,
            resource_monitoring: true,
        }
    }

    /// Tune the strategy from the last run's metrics.
    ///
    /// A completion rate under 80% steps towards conservative; otherwise a
    /// speedup under 1.2 steps towards aggressive. Resource utilization
    /// outside 30-90% is reported as a suggestion only.
    pub async fn optimize(&mut self) -> OptimizationReport {
        let mut report = OptimizationReport::default();

        let status = self.orchestrator.resources().status().await;
        for (name, pct) in [
            ("tokens", status.utilization.tokens),
            ("memory", status.utilization.memory),
            ("cpu", status.utilization.cpu),
            ("agents", status.utilization.agents),
        ] {
            if pct < 30.0 {
                report.suggestions.push(format!("increase_{}_allocation", name));
            } else if pct > 90.0 {
                report.suggestions.push(format!("reduce_{}_allocation", name));
            }
        }

        let Some(metrics) = self.orchestrator.metrics().await else {
            return report;
        };
        let current = self.strategy();
        let completion_rate = metrics.completion_rate();
        let speedup = metrics.speedup(self.config.orchestrator.assumed_minutes_per_task);

        if completion_rate < LOW_COMPLETION_RATE {
            let next = current.more_conservative();
            if next != current {
                self.set_strategy(next);
                report.applied.push(format!("reduced_strategy_to_{}", next));
            }
        } else if speedup < LOW_SPEEDUP {
            let next = current.more_aggressive();
            if next != current {
                self.set_strategy(next);
                report.applied.push(format!("increased_strategy_to_{}", next));
            }
        }

        info!(applied = ?report.applied, "Applied parallel execution optimizations");
        report
    }
}
