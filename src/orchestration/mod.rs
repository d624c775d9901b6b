//! Planning and execution.
//!
//! The [`DependencyAnalyzer`] turns tasks into a staged plan, the
//! [`ParallelOrchestrator`] executes plans against an [`ExecutorRegistry`],
//! and the [`ProjectRunner`] drives a whole project through its lifecycle.

pub mod analyzer;
pub mod estimate;
pub mod executor;
pub mod parallel;
pub mod runner;
pub mod status;
pub mod strategy;

pub use analyzer::{DependencyAnalyzer, GroupId, ParallelExecutionPlan, PlanSummary, TaskGroup};
pub use executor::{ExecutionOutcome, Executor, ExecutorRegistry};
pub use parallel::{CancelHandle, ParallelOrchestrator};
pub use runner::{OptimizationReport, ParallelCapabilities, ProjectRunner};
pub use status::{ExecutionMetrics, ExecutionState, ExecutionStatus};
pub use strategy::{ExecutionMode, ParallelStrategy};
