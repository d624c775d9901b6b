//! Project state: the aggregate that owns every task of a run.
//!
//! All mutation goes through methods on [`ProjectState`] so that
//! `updated_at` and the project log stay consistent with task changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

use crate::core::task::{Task, TaskId, TaskStatus, Team};
use crate::error::{Error, Result};

/// Current version of the persisted snapshot format.
pub const PROJECT_STATE_VERSION: u32 = 1;

/// Unique identifier for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    /// Create a new unique project identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Executing,
    Paused,
    Complete,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Complete | ProjectStatus::Failed)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Planning => write!(f, "planning"),
            ProjectStatus::Executing => write!(f, "executing"),
            ProjectStatus::Paused => write!(f, "paused"),
            ProjectStatus::Complete => write!(f, "complete"),
            ProjectStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One entry in the project's own activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Component or executor that produced the entry.
    pub source: String,
    pub message: String,
}

/// Accumulated usage for one executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub team: Team,
    pub tokens_used: u64,
    pub call_count: u64,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.queued + self.in_progress + self.complete + self.failed
    }

    fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Complete => self.complete += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Read-only summary of a project for listings and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub objective: String,
    pub status: ProjectStatus,
    pub counts: StatusCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The aggregate root for a run.
///
/// Tasks are stored in declaration order with an id index for lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ProjectSnapshot")]
pub struct ProjectState {
    pub version: u32,
    pub id: ProjectId,
    pub objective: String,
    status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    tasks: Vec<Task>,
    logs: Vec<LogEntry>,
    agents: BTreeMap<String, AgentUsage>,
    #[serde(skip)]
    index: HashMap<TaskId, usize>,
}

#[derive(Deserialize)]
struct ProjectSnapshot {
    #[serde(default)]
    version: u32,
    id: ProjectId,
    objective: String,
    status: ProjectStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    logs: Vec<LogEntry>,
    #[serde(default)]
    agents: BTreeMap<String, AgentUsage>,
}

impl From<ProjectSnapshot> for ProjectState {
    fn from(s: ProjectSnapshot) -> Self {
        let mut state = Self {
            version: s.version,
            id: s.id,
            objective: s.objective,
            status: s.status,
            created_at: s.created_at,
            updated_at: s.updated_at,
            tasks: s.tasks,
            logs: s.logs,
            agents: s.agents,
            index: HashMap::new(),
        };
        state.reindex();
        state
    }
}

impl ProjectState {
    /// Create a new project in `Planning` status.
    pub fn new(objective: &str) -> Self {
        let now = Utc::now();
        Self {
            version: PROJECT_STATE_VERSION,
            id: ProjectId::new(),
            objective: objective.to_string(),
            status: ProjectStatus::Planning,
            created_at: now,
            updated_at: now,
            tasks: Vec::new(),
            logs: Vec::new(),
            agents: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, task) in self.tasks.iter().enumerate() {
            self.index.entry(task.id.clone()).or_insert(i);
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn status(&self) -> ProjectStatus {
        self.status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn agents(&self) -> &BTreeMap<String, AgentUsage> {
        &self.agents
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append an entry to the project log.
    pub fn add_log_entry(&mut self, level: LogLevel, source: &str, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            source: source.to_string(),
            message: message.into(),
        });
        self.touch();
    }

    /// Change the project status and log the change.
    pub fn set_status(&mut self, status: ProjectStatus) {
        if self.status == status {
            return;
        }
        let message = format!("Project status: {} -> {}", self.status, status);
        self.status = status;
        self.add_log_entry(LogLevel::Info, "orchestrator", message);
    }

    /// Add a task.
    ///
    /// # Errors
    /// Returns `Error::DuplicateTaskId` if a task with the same id exists.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::DuplicateTaskId(task.id.to_string()));
        }
        let message = format!("Added task {} ({})", task.id, task.team);
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        self.add_log_entry(LogLevel::Info, "orchestrator", message);
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).and_then(|&i| self.tasks.get(i))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        self.tasks
            .get_mut(idx)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// Move a task through its lifecycle and log the change.
    ///
    /// # Errors
    /// Returns `Error::TaskNotFound` for an unknown id and
    /// `Error::InvalidTransition` for an illegal move.
    pub fn update_task_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let task = self.task_mut(id)?;
        task.transition(status, error)?;
        let (level, message) = match (status, error) {
            (TaskStatus::Failed, Some(e)) => {
                (LogLevel::Error, format!("Task {} failed: {}", id, e))
            }
            _ => (LogLevel::Info, format!("Task {} -> {}", id, status)),
        };
        self.add_log_entry(level, "orchestrator", message);
        Ok(())
    }

    /// Append an artifact reference to a non-terminal task.
    pub fn append_artifact(&mut self, id: &TaskId, artifact: &str) -> Result<()> {
        self.task_mut(id)?.append_artifact(artifact)?;
        self.touch();
        Ok(())
    }

    /// Accumulate token usage for an executor.
    pub fn record_agent_usage(&mut self, agent: &str, team: Team, tokens: u64) {
        let entry = self.agents.entry(agent.to_string()).or_insert_with(|| AgentUsage {
            team,
            ..Default::default()
        });
        entry.tokens_used += tokens;
        entry.call_count += 1;
        self.touch();
    }

    /// Drop dependency ids that reference no known task.
    ///
    /// Returns the removed `(task, dependency)` pairs. Each removal is logged
    /// as a warning both to tracing and to the project log.
    pub fn prune_dangling_dependencies(&mut self) -> Vec<(TaskId, TaskId)> {
        let mut removed = Vec::new();
        for i in 0..self.tasks.len() {
            let dangling: Vec<TaskId> = self.tasks[i]
                .dependencies
                .iter()
                .filter(|d| !self.index.contains_key(*d))
                .cloned()
                .collect();
            if dangling.is_empty() {
                continue;
            }
            self.tasks[i].dependencies.retain(|d| !dangling.contains(d));
            for dep in dangling {
                removed.push((self.tasks[i].id.clone(), dep));
            }
        }
        for (task, dep) in &removed {
            warn!(task = %task, dependency = %dep, "Dropping dangling dependency");
            self.add_log_entry(
                LogLevel::Warning,
                "orchestrator",
                format!("Task {} depends on unknown task {}; dependency dropped", task, dep),
            );
        }
        removed
    }

    /// Tasks that are queued and whose known dependencies are all complete.
    ///
    /// Unknown dependency ids are ignored here; call
    /// [`prune_dangling_dependencies`](Self::prune_dangling_dependencies)
    /// to remove and report them.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .filter(|t| {
                t.dependencies.iter().all(|dep| match self.get_task(dep) {
                    Some(d) => d.status == TaskStatus::Complete,
                    None => true,
                })
            })
            .collect()
    }

    /// Queued tasks that can never become ready because a dependency,
    /// directly or transitively, has failed.
    pub fn blocked_tasks(&self) -> Vec<&Task> {
        let mut blocked: HashSet<&TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| &t.id)
            .collect();
        loop {
            let newly: Vec<&TaskId> = self
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Queued && !blocked.contains(&t.id))
                .filter(|t| t.dependencies.iter().any(|d| blocked.contains(d)))
                .map(|t| &t.id)
                .collect();
            if newly.is_empty() {
                break;
            }
            blocked.extend(newly);
        }
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && blocked.contains(&t.id))
            .collect()
    }

    /// Queued tasks whose every dependency is either `Complete` or itself
    /// runnable. These are the tasks a parallel run can plan over; a task
    /// behind a failed or still running dependency is left out, along with
    /// everything downstream of it.
    pub fn runnable_tasks(&self) -> Vec<&Task> {
        let mut runnable: HashSet<&TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| &t.id)
            .collect();
        loop {
            let held: Vec<&TaskId> = self
                .tasks
                .iter()
                .filter(|t| runnable.contains(&t.id))
                .filter(|t| {
                    t.dependencies.iter().any(|dep| {
                        !runnable.contains(dep)
                            && self
                                .get_task(dep)
                                .is_some_and(|d| d.status != TaskStatus::Complete)
                    })
                })
                .map(|t| &t.id)
                .collect();
            if held.is_empty() {
                break;
            }
            for id in held {
                runnable.remove(id);
            }
        }
        self.tasks
            .iter()
            .filter(|t| runnable.contains(&t.id))
            .collect()
    }

    /// Every task is `Complete`. An empty project counts as complete.
    pub fn all_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Complete)
    }

    /// Every task reached a terminal state.
    pub fn all_finished(&self) -> bool {
        self.tasks.iter().all(Task::is_finished)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            counts.record(task.status);
        }
        counts
    }

    /// Task counts broken down by team.
    pub fn team_status(&self) -> BTreeMap<Team, StatusCounts> {
        let mut by_team: BTreeMap<Team, StatusCounts> = BTreeMap::new();
        for task in &self.tasks {
            by_team.entry(task.team).or_default().record(task.status);
        }
        by_team
    }

    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id,
            objective: self.objective.clone(),
            status: self.status,
            counts: self.status_counts(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with(tasks: Vec<Task>) -> ProjectState {
        let mut project = ProjectState::new("test objective");
        for task in tasks {
            project.add_task(task).unwrap();
        }
        project
    }

    // ProjectId tests

    #[test]
    fn test_project_id_short_and_parse() {
        let id = ProjectId::new();
        assert_eq!(id.short().len(), 8);
        let parsed: ProjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    // Task management

    #[test]
    fn test_new_project_is_planning() {
        let project = ProjectState::new("build it");
        assert_eq!(project.status(), ProjectStatus::Planning);
        assert!(project.tasks().is_empty());
        assert!(project.all_complete());
    }

    #[test]
    fn test_add_task_rejects_duplicates() {
        let mut project = project_with(vec![Task::new("a", "x", Team::Backend)]);
        let err = project.add_task(Task::new("a", "y", Team::Qa)).unwrap_err();
        assert!(matches!(err, Error::DuplicateTaskId(id) if id == "a"));
        assert_eq!(project.tasks().len(), 1);
    }

    #[test]
    fn test_update_task_status_logs_and_bumps_updated_at() {
        let mut project = project_with(vec![Task::new("a", "x", Team::Backend)]);
        let before = project.updated_at();
        let logs_before = project.logs().len();

        project
            .update_task_status(&TaskId::new("a"), TaskStatus::InProgress, None)
            .unwrap();

        assert!(project.updated_at() >= before);
        assert_eq!(project.logs().len(), logs_before + 1);
        assert_eq!(
            project.get_task(&TaskId::new("a")).unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_update_unknown_task_fails() {
        let mut project = ProjectState::new("x");
        let err = project
            .update_task_status(&TaskId::new("ghost"), TaskStatus::InProgress, None)
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }

    #[test]
    fn test_failed_update_logs_error_level() {
        let mut project = project_with(vec![Task::new("a", "x", Team::Backend)]);
        let id = TaskId::new("a");
        project.update_task_status(&id, TaskStatus::InProgress, None).unwrap();
        project
            .update_task_status(&id, TaskStatus::Failed, Some("boom"))
            .unwrap();
        let last = project.logs().last().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.contains("boom"));
    }

    // Readiness

    #[test]
    fn test_ready_tasks_respects_dependencies() {
        let mut project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Frontend).depends_on(["a"]),
        ]);
        let ready: Vec<_> = project.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec![TaskId::new("a")]);

        let a = TaskId::new("a");
        project.update_task_status(&a, TaskStatus::InProgress, None).unwrap();
        assert!(project.ready_tasks().is_empty());
        project.update_task_status(&a, TaskStatus::Complete, None).unwrap();

        let ready: Vec<_> = project.ready_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec![TaskId::new("b")]);
    }

    #[test]
    fn test_failed_dependency_blocks_readiness() {
        let mut project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Frontend).depends_on(["a"]),
        ]);
        project
            .update_task_status(&TaskId::new("a"), TaskStatus::Failed, Some("nope"))
            .unwrap();
        assert!(project.ready_tasks().is_empty());
        assert!(!project.all_finished());
    }

    #[test]
    fn test_blocked_and_runnable_tasks() {
        let mut project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Frontend).depends_on(["a"]),
            Task::new("c", "x", Team::Qa).depends_on(["b"]),
            Task::new("d", "x", Team::Qa),
        ]);
        assert_eq!(project.runnable_tasks().len(), 4);

        project
            .update_task_status(&TaskId::new("a"), TaskStatus::Failed, Some("nope"))
            .unwrap();

        let blocked: Vec<_> = project.blocked_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(blocked, vec![TaskId::new("b"), TaskId::new("c")]);
        let runnable: Vec<_> = project.runnable_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(runnable, vec![TaskId::new("d")]);
    }

    #[test]
    fn test_running_dependency_holds_dependents() {
        let mut project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Frontend).depends_on(["a"]),
            Task::new("c", "x", Team::Qa).depends_on(["b"]),
            Task::new("d", "x", Team::Qa),
            Task::new("e", "x", Team::Qa).depends_on(["d"]),
        ]);
        project
            .update_task_status(&TaskId::new("a"), TaskStatus::InProgress, None)
            .unwrap();

        assert!(project.blocked_tasks().is_empty());
        let runnable: Vec<_> = project.runnable_tasks().iter().map(|t| t.id.clone()).collect();
        assert_eq!(runnable, vec![TaskId::new("d"), TaskId::new("e")]);

        project
            .update_task_status(&TaskId::new("a"), TaskStatus::Complete, None)
            .unwrap();
        assert_eq!(project.runnable_tasks().len(), 4);
    }

    #[test]
    fn test_prune_dangling_dependencies() {
        let mut project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Frontend).depends_on(["a", "ghost"]),
        ]);
        let removed = project.prune_dangling_dependencies();
        assert_eq!(removed, vec![(TaskId::new("b"), TaskId::new("ghost"))]);
        assert_eq!(
            project.get_task(&TaskId::new("b")).unwrap().dependencies,
            vec![TaskId::new("a")]
        );
        assert!(project
            .logs()
            .iter()
            .any(|l| l.level == LogLevel::Warning && l.message.contains("ghost")));
    }

    // Projections

    #[test]
    fn test_status_counts_and_team_status() {
        let mut project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Backend),
            Task::new("c", "x", Team::Qa),
        ]);
        project
            .update_task_status(&TaskId::new("a"), TaskStatus::InProgress, None)
            .unwrap();

        let counts = project.status_counts();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.total(), 3);

        let teams = project.team_status();
        assert_eq!(teams[&Team::Backend].total(), 2);
        assert_eq!(teams[&Team::Qa].queued, 1);
    }

    #[test]
    fn test_record_agent_usage_accumulates() {
        let mut project = ProjectState::new("x");
        project.record_agent_usage("backend", Team::Backend, 100);
        project.record_agent_usage("backend", Team::Backend, 50);
        let usage = &project.agents()["backend"];
        assert_eq!(usage.tokens_used, 150);
        assert_eq!(usage.call_count, 2);
    }

    #[test]
    fn test_set_status_logs_change_once() {
        let mut project = ProjectState::new("x");
        project.set_status(ProjectStatus::Executing);
        project.set_status(ProjectStatus::Executing);
        let count = project
            .logs()
            .iter()
            .filter(|l| l.message.contains("executing"))
            .count();
        assert_eq!(count, 1);
    }

    // Serialization

    #[test]
    fn test_deserialize_rebuilds_index() {
        let project = project_with(vec![
            Task::new("a", "x", Team::Backend),
            Task::new("b", "x", Team::Frontend).depends_on(["a"]),
        ]);
        let json = serde_json::to_string(&project).unwrap();
        let restored: ProjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, project.id);
        assert!(restored.get_task(&TaskId::new("b")).is_some());
        assert_eq!(restored.ready_tasks().len(), 1);
        assert!(!json.contains("index"));
    }
}
