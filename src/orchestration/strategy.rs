//! Parallelism presets and execution modes.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How aggressively the analyzer packs tasks into groups and stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelStrategy {
    Conservative,
    Balanced,
    Aggressive,
}

impl Default for ParallelStrategy {
    fn default() -> Self {
        Self::Balanced
    }
}

impl ParallelStrategy {
    pub const ALL: [ParallelStrategy; 3] = [
        ParallelStrategy::Conservative,
        ParallelStrategy::Balanced,
        ParallelStrategy::Aggressive,
    ];

    /// Upper bound on tasks per group.
    pub fn max_group_size(&self) -> usize {
        match self {
            ParallelStrategy::Conservative => 3,
            ParallelStrategy::Balanced => 5,
            ParallelStrategy::Aggressive => 8,
        }
    }

    /// Upper bound on groups per stage.
    pub fn max_concurrent_groups(&self) -> usize {
        match self {
            ParallelStrategy::Conservative => 2,
            ParallelStrategy::Balanced => 4,
            ParallelStrategy::Aggressive => 6,
        }
    }

    /// One step towards more parallelism, saturating at `Aggressive`.
    pub fn more_aggressive(&self) -> Self {
        match self {
            ParallelStrategy::Conservative => ParallelStrategy::Balanced,
            _ => ParallelStrategy::Aggressive,
        }
    }

    /// One step towards less parallelism, saturating at `Conservative`.
    pub fn more_conservative(&self) -> Self {
        match self {
            ParallelStrategy::Aggressive => ParallelStrategy::Balanced,
            _ => ParallelStrategy::Conservative,
        }
    }
}

impl std::fmt::Display for ParallelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParallelStrategy::Conservative => write!(f, "conservative"),
            ParallelStrategy::Balanced => write!(f, "balanced"),
            ParallelStrategy::Aggressive => write!(f, "aggressive"),
        }
    }
}

impl std::str::FromStr for ParallelStrategy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(ParallelStrategy::Conservative),
            "balanced" => Ok(ParallelStrategy::Balanced),
            "aggressive" => Ok(ParallelStrategy::Aggressive),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

/// How the orchestrator walks a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One ready task at a time.
    Sequential,
    /// Stage by stage, groups in a stage concurrently.
    Parallel,
    /// Parallel when the plan's parallelism factor clears a threshold.
    Hybrid,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
            ExecutionMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "hybrid" => Ok(ExecutionMode::Hybrid),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}
