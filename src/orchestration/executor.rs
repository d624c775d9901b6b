//! Executor seam.
//!
//! The orchestrator never does the work itself. Each task is handed to an
//! [`Executor`] chosen by team through an [`ExecutorRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Task, Team};
use crate::{Error, Result};

/// What an executor reports back for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// References to produced artifacts, appended to the task on completion.
    pub artifacts: Vec<String>,
    pub error: Option<String>,
    pub tokens_used: u64,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// Turns a task into output.
///
/// Returning `Err` is treated the same as an unsuccessful outcome: the task
/// fails with the error text and the run continues.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<ExecutionOutcome>;

    /// Name recorded in per-agent usage.
    fn name(&self) -> &str {
        "executor"
    }
}

/// Maps teams to executors.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<Team, Arc<dyn Executor>>,
    fallback: Option<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that sends every team to `executor`.
    pub fn with_fallback(executor: Arc<dyn Executor>) -> Self {
        Self {
            executors: HashMap::new(),
            fallback: Some(executor),
        }
    }

    pub fn register(&mut self, team: Team, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(team, executor);
        self
    }

    pub fn set_fallback(&mut self, executor: Arc<dyn Executor>) -> &mut Self {
        self.fallback = Some(executor);
        self
    }

    /// # Errors
    /// Returns `Error::NoExecutor` if neither the team nor a fallback is
    /// registered.
    pub fn resolve(&self, team: Team) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(&team)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| Error::NoExecutor(team.to_string()))
    }

    pub fn teams(&self) -> Vec<Team> {
        let mut teams: Vec<Team> = self.executors.keys().copied().collect();
        teams.sort();
        teams
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("teams", &self.teams())
            .field("fallback", &self.has_fallback())
            .finish()
    }
}
