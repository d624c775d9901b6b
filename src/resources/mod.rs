//! Resource budget tracking, host telemetry, and the background monitor.

pub mod manager;
pub mod monitor;
pub mod telemetry;
pub mod types;

pub use manager::{
    PerformanceMetrics, ResourceManager, ResourceStatus, UsageSnapshot, UtilizationPercent,
    DEFAULT_CONCURRENCY,
};
pub use monitor::{start_monitoring, MonitorHandle};
pub use telemetry::{FixedTelemetry, SysinfoTelemetry, SystemSample, TelemetrySource};
pub use types::{ResourceAllocation, ResourceUsage, ResourceVector, Utilization};
