//! Host telemetry sources.
//!
//! The resource manager only needs a periodic [`SystemSample`]; where it
//! comes from is behind [`TelemetrySource`] so tests can feed fixed numbers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;

use crate::util::blocking_with_timeout;
use crate::{Error, Result};

const SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One observation of host load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    pub total_memory_mb: f64,
    pub available_memory_mb: f64,
    pub cpu_count: usize,
    /// 0-100 across all cores.
    pub cpu_percent: f64,
    /// One, five, and fifteen minute load averages.
    pub load_average: (f64, f64, f64),
}

impl SystemSample {
    pub fn memory_usage_percent(&self) -> f64 {
        if self.total_memory_mb <= 0.0 {
            return 0.0;
        }
        (self.total_memory_mb - self.available_memory_mb) / self.total_memory_mb * 100.0
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.available_memory_mb / 1024.0
    }
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample(&self) -> Result<SystemSample>;
}

/// Reads the local host through `sysinfo`.
///
/// CPU usage is a delta between refreshes, so the first sample after
/// construction may read as 0%.
pub struct SysinfoTelemetry {
    sys: Arc<Mutex<System>>,
}

impl SysinfoTelemetry {
    pub fn new() -> Self {
        Self {
            sys: Arc::new(Mutex::new(System::new_all())),
        }
    }
}

impl Default for SysinfoTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for SysinfoTelemetry {
    async fn sample(&self) -> Result<SystemSample> {
        let sys = Arc::clone(&self.sys);
        blocking_with_timeout(SAMPLE_TIMEOUT, move || {
            let mut sys = sys
                .lock()
                .map_err(|_| Error::Telemetry("system handle poisoned".into()))?;
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let load = System::load_average();
            Ok(SystemSample {
                timestamp: Utc::now(),
                total_memory_mb: sys.total_memory() as f64 / BYTES_PER_MB,
                available_memory_mb: sys.available_memory() as f64 / BYTES_PER_MB,
                cpu_count: sys.cpus().len(),
                cpu_percent: sys.global_cpu_usage() as f64,
                load_average: (load.one, load.five, load.fifteen),
            })
        })
        .await
    }
}

/// Returns whatever sample it was last given.
#[derive(Clone)]
pub struct FixedTelemetry {
    sample: Arc<Mutex<SystemSample>>,
}

impl FixedTelemetry {
    pub fn new(cpu_count: usize, cpu_percent: f64, total_memory_mb: f64, available_memory_mb: f64) -> Self {
        Self {
            sample: Arc::new(Mutex::new(SystemSample {
                timestamp: Utc::now(),
                total_memory_mb,
                available_memory_mb,
                cpu_count,
                cpu_percent,
                load_average: (0.0, 0.0, 0.0),
            })),
        }
    }

    /// Replace the reported CPU and available memory.
    pub fn set(&self, cpu_percent: f64, available_memory_mb: f64) {
        if let Ok(mut sample) = self.sample.lock() {
            sample.cpu_percent = cpu_percent;
            sample.available_memory_mb = available_memory_mb;
        }
    }
}

#[async_trait]
impl TelemetrySource for FixedTelemetry {
    async fn sample(&self) -> Result<SystemSample> {
        let mut sample = self
            .sample
            .lock()
            .map_err(|_| Error::Telemetry("fixed sample poisoned".into()))?
            .clone();
        sample.timestamp = Utc::now();
        Ok(sample)
    }
}
