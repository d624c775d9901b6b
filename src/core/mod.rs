//! Core domain models for maos orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, the project aggregate that owns them,
//! and the dependency DAG built over them.

pub mod dag;
pub mod project;
pub mod task;

pub use dag::{Reachability, TaskDAG};
pub use project::{
    AgentUsage, LogEntry, LogLevel, ProjectId, ProjectState, ProjectStatus, ProjectSummary,
    StatusCounts,
};
pub use task::{Task, TaskId, TaskStatus, Team};
