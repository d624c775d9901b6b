//! Task data model.
//!
//! Tasks are the atomic units of work handed to executors. Each task
//! tracks its team, dependencies, status, attempts, and produced artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a task within a project.
///
/// Callers may supply their own ids (`"api"`, `"T-12"`); [`TaskId::generate`]
/// produces a UUID v4 based id when none is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a new unique task identifier.
    pub fn generate() -> Self {
        Self(format!("task_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("task id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Executor class a task is routed to.
///
/// Unknown tags map to [`Team::General`] so persisted state written by a
/// newer build still loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Team {
    Frontend,
    Backend,
    Qa,
    Research,
    Documentation,
    General,
}

impl Team {
    pub const ALL: [Team; 6] = [
        Team::Frontend,
        Team::Backend,
        Team::Qa,
        Team::Research,
        Team::Documentation,
        Team::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Frontend => "frontend",
            Team::Backend => "backend",
            Team::Qa => "qa",
            Team::Research => "research",
            Team::Documentation => "documentation",
            Team::General => "general",
        }
    }

    /// Parse a team tag. Never fails; unrecognized tags become `General`.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "frontend" | "ui" => Team::Frontend,
            "backend" | "api" => Team::Backend,
            "qa" | "test" | "testing" => Team::Qa,
            "research" => Team::Research,
            "documentation" | "docs" => Team::Documentation,
            _ => Team::General,
        }
    }
}

impl Default for Team {
    fn default() -> Self {
        Self::General
    }
}

impl std::fmt::Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Team {
    fn from(s: String) -> Self {
        Team::parse(&s)
    }
}

impl From<Team> for String {
    fn from(team: Team) -> Self {
        team.as_str().to_string()
    }
}

/// Task status in its lifecycle.
///
/// Legal moves are `Queued -> InProgress -> {Complete | Failed}` plus
/// `Queued -> Failed` for tasks whose group was cancelled or timed out
/// before their executor call began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies or a free slot.
    Queued,
    /// Handed to an executor.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::InProgress)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Complete)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// What the task should accomplish.
    pub description: String,
    /// Executor class responsible for the task.
    pub team: Team,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Ids of tasks that must complete first, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Number of times the task has been started.
    #[serde(default)]
    pub attempts: u32,
    /// Error captured when the task failed.
    #[serde(default)]
    pub error: Option<String>,
    /// References to outputs the executor produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task last started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a queued task with no dependencies.
    pub fn new(id: impl Into<TaskId>, description: &str, team: Team) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            team,
            status: TaskStatus::Queued,
            dependencies: Vec::new(),
            attempts: 0,
            error: None,
            artifacts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Create a queued task with a generated id.
    pub fn with_generated_id(description: &str, team: Team) -> Self {
        Self::new(TaskId::generate(), description, team)
    }

    /// Builder-style setter for dependencies.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Move to `next`, rejecting anything outside the lifecycle.
    ///
    /// # Errors
    /// Returns `Error::InvalidTransition` for an illegal move.
    pub fn transition(&mut self, next: TaskStatus, error: Option<&str>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskStatus::InProgress => {
                self.attempts += 1;
                self.started_at = Some(Utc::now());
                self.error = None;
            }
            TaskStatus::Complete => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Failed => {
                self.error = Some(error.unwrap_or("unknown error").to_string());
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Queued => {}
        }
        self.status = next;
        Ok(())
    }

    /// Start the task. Increments the attempt counter.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::InProgress, None)
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(TaskStatus::Complete, None)
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(TaskStatus::Failed, Some(error))
    }

    /// Record an output reference. Only allowed before the task finishes.
    pub fn append_artifact(&mut self, artifact: &str) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TaskFinished(self.id.to_string()));
        }
        self.artifacts.push(artifact.to_string());
        Ok(())
    }

    /// Check if the task is in a terminal state (Complete or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task can be started.
    pub fn can_start(&self) -> bool {
        self.status == TaskStatus::Queued
    }
}
