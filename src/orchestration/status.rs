//! Execution metrics and the read-only status projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resources::ResourceVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NotStarted,
    Running,
    Completed,
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::NotStarted => write!(f, "not_started"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Completed => write!(f, "completed"),
        }
    }
}

/// Counters for one `execute` call. Reporting only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub groups_executed: usize,
    pub stages_completed: usize,
    pub max_concurrent_groups: usize,
    /// Largest summed group estimate that ran at once.
    pub resource_high_water: ResourceVector,
}

impl ExecutionMetrics {
    pub fn start(total_tasks: usize) -> Self {
        Self {
            started_at: Some(Utc::now()),
            total_tasks,
            ..Default::default()
        }
    }

    /// Percent of all tasks completed during this run.
    pub fn completion_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.completed_tasks as f64 / self.total_tasks as f64 * 100.0
    }

    /// Wall time from start to finish, or to now while running.
    pub fn elapsed(&self) -> Duration {
        let Some(start) = self.started_at else {
            return Duration::ZERO;
        };
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - start).to_std().unwrap_or(Duration::ZERO)
    }

    /// Assumed sequential time (`minutes_per_task` each) over elapsed time.
    pub fn speedup(&self, minutes_per_task: f64) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 1.0;
        }
        self.total_tasks as f64 * minutes_per_task * 60.0 / elapsed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub completion_rate: f64,
    pub elapsed: Duration,
    pub active_groups: usize,
    pub completed_groups: usize,
    pub failed_groups: usize,
    pub stages_completed: usize,
    pub max_concurrent_groups: usize,
    pub resource_high_water: ResourceVector,
    pub estimated_speedup: f64,
}

impl ExecutionStatus {
    pub fn not_started() -> Self {
        Self {
            state: ExecutionState::NotStarted,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            completion_rate: 0.0,
            elapsed: Duration::ZERO,
            active_groups: 0,
            completed_groups: 0,
            failed_groups: 0,
            stages_completed: 0,
            max_concurrent_groups: 0,
            resource_high_water: ResourceVector::ZERO,
            estimated_speedup: 0.0,
        }
    }
}
