pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod resources;
pub mod state;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::{
    DependencyAnalyzer, ExecutionMode, ExecutionOutcome, Executor, ExecutorRegistry,
    ParallelExecutionPlan, ParallelOrchestrator, ParallelStrategy, ProjectRunner,
};
