//! Shared resource budget.
//!
//! The `ResourceManager` is the only mutable structure shared between the
//! orchestrator and the background monitor. All of its state sits behind a
//! single async mutex, so every operation observes a consistent view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ResourceConfig, ResourceLimits, ResourceThresholds};
use crate::resources::telemetry::{SystemSample, TelemetrySource};
use crate::resources::types::{ResourceAllocation, ResourceUsage};

/// Concurrency suggested when no telemetry has been sampled yet.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Number of history samples averaged by [`ResourceManager::performance_metrics`].
const METRICS_WINDOW: usize = 20;

/// Auto-scaling never shrinks memory or CPU limits below this share of the
/// configured limits.
const AUTO_SCALE_FLOOR: f64 = 0.25;

/// One history sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tokens: f64,
    pub memory_mb: f64,
    /// Host CPU percent at sample time.
    pub cpu_percent: f64,
    pub agents: u32,
    pub system_memory_percent: f64,
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub limits: ResourceLimits,
    pub committed: ResourceAllocation,
    /// Percent of each limit currently committed.
    pub utilization: UtilizationPercent,
    pub active_allocations: usize,
    pub tracked_records: usize,
    pub system: Option<SystemSample>,
    pub forced_allocations: u64,
    pub refused_allocations: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilizationPercent {
    pub tokens: f64,
    pub memory: f64,
    pub cpu: f64,
    pub agents: f64,
}

/// Aggregates over recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub average_cpu_usage: f64,
    pub average_memory_usage: f64,
    pub average_concurrent_agents: f64,
    /// 0-100; 100 when every resource sits at 60-70% of its limit.
    pub resource_efficiency: f64,
    pub optimization_opportunities: Vec<String>,
}

struct Inner {
    limits: ResourceLimits,
    live: HashMap<String, ResourceUsage>,
    released: HashMap<String, ResourceUsage>,
    history: VecDeque<UsageSnapshot>,
    last_sample: Option<SystemSample>,
    forced: u64,
    refused: u64,
}

impl Inner {
    fn committed(&self) -> ResourceAllocation {
        self.live
            .values()
            .fold(ResourceAllocation::default(), |acc, u| acc.plus(&u.committed()))
    }

    fn committed_excluding(&self, id: &str) -> ResourceAllocation {
        self.live
            .iter()
            .filter(|(k, _)| k.as_str() != id)
            .fold(ResourceAllocation::default(), |acc, (_, u)| {
                acc.plus(&u.committed())
            })
    }

    fn utilization(&self) -> UtilizationPercent {
        let c = self.committed();
        let l = &self.limits;
        UtilizationPercent {
            tokens: percent(c.tokens, l.max_tokens),
            memory: percent(c.memory_mb, l.max_memory_mb),
            cpu: percent(c.cpu_percent, l.max_cpu_percent),
            agents: percent(c.agents as f64, l.max_concurrent_agents as f64),
        }
    }
}

fn percent(value: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        value / limit * 100.0
    } else {
        0.0
    }
}

/// Tracks allocations against limits and adapts the limits to host load.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct ResourceManager {
    config: Arc<ResourceConfig>,
    inner: Arc<Mutex<Inner>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig) -> Self {
        info!(
            tokens = config.limits.max_tokens,
            memory_mb = config.limits.max_memory_mb,
            cpu = config.limits.max_cpu_percent,
            agents = config.limits.max_concurrent_agents,
            "Resource manager initialized"
        );
        let inner = Inner {
            limits: config.limits,
            live: HashMap::new(),
            released: HashMap::new(),
            history: VecDeque::with_capacity(config.history_limit),
            last_sample: None,
            forced: 0,
            refused: 0,
        };
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(inner)),
            telemetry: None,
        }
    }

    /// Attach a telemetry source used by [`sample_and_adjust`](Self::sample_and_adjust).
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// The configured limits, before any auto-scaling.
    pub fn base_limits(&self) -> ResourceLimits {
        self.config.limits
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        self.config.thresholds
    }

    /// The limits currently enforced.
    pub async fn limits(&self) -> ResourceLimits {
        self.inner.lock().await.limits
    }

    /// Restore the configured limits, undoing auto-scaling.
    pub async fn reset_limits(&self) {
        self.inner.lock().await.limits = self.config.limits;
        info!("Resource limits reset to configured values");
    }

    /// Reserve resources for `id`.
    ///
    /// Refused (returning `false`, state unchanged) if committed usage plus
    /// the request would exceed `limit * maximum` for any resource, unless
    /// `force` is set. Allocating an id that is already live replaces its
    /// previous reservation.
    pub async fn try_allocate(&self, id: &str, request: ResourceAllocation, force: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let max = self.config.thresholds.maximum;
        let limits = inner.limits;
        let total = inner.committed_excluding(id).plus(&request);

        let over: Vec<&str> = [
            ("tokens", total.tokens > limits.max_tokens * max),
            ("memory", total.memory_mb > limits.max_memory_mb * max),
            ("cpu", total.cpu_percent > limits.max_cpu_percent * max),
            (
                "agents",
                total.agents as f64 > limits.max_concurrent_agents as f64 * max,
            ),
        ]
        .into_iter()
        .filter(|(_, exceeded)| *exceeded)
        .map(|(name, _)| name)
        .collect();

        if !over.is_empty() {
            if !force {
                inner.refused += 1;
                warn!(id, resources = ?over, "Allocation refused: would exceed limits");
                return false;
            }
            inner.forced += 1;
            warn!(id, resources = ?over, "Forcing allocation past limits");
        }

        inner.released.remove(id);
        inner.live.insert(id.to_string(), ResourceUsage::new(request));
        debug!(id, score = request.total_score(), "Resources allocated");
        true
    }

    /// Record observed usage for a live or recently released allocation.
    ///
    /// Logs when utilization of the allocation crosses the warning or
    /// critical threshold. Unknown ids are ignored with a warning.
    pub async fn update_usage(&self, id: &str, used: ResourceAllocation) {
        let mut guard = self.inner.lock().await;
        let Inner { live, released, .. } = &mut *guard;
        let Some(usage) = live.get_mut(id).or_else(|| released.get_mut(id)) else {
            warn!(id, "No usage record to update");
            return;
        };
        usage.record(used);
        let peak = usage.utilization().peak();
        let t = self.config.thresholds;
        if peak > t.critical {
            warn!(id, utilization = peak, "Resource usage critical");
        } else if peak > t.warning {
            info!(id, utilization = peak, "Resource usage high");
        }
    }

    /// Release the live allocation for `id`.
    ///
    /// The usage record is retained for analysis until the retention window
    /// expires.
    pub async fn release(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(mut usage) = inner.live.remove(id) {
            usage.last_updated = Utc::now();
            inner.released.insert(id.to_string(), usage);
            debug!(id, "Resources released");
        }
    }

    /// Sum of committed usage over live allocations.
    pub async fn committed(&self) -> ResourceAllocation {
        self.inner.lock().await.committed()
    }

    pub async fn is_allocated(&self, id: &str) -> bool {
        self.inner.lock().await.live.contains_key(id)
    }

    /// Usage record for an id, live or retained.
    pub async fn usage(&self, id: &str) -> Option<ResourceUsage> {
        let inner = self.inner.lock().await;
        inner
            .live
            .get(id)
            .or_else(|| inner.released.get(id))
            .cloned()
    }

    pub async fn status(&self) -> ResourceStatus {
        let inner = self.inner.lock().await;
        ResourceStatus {
            limits: inner.limits,
            committed: inner.committed(),
            utilization: inner.utilization(),
            active_allocations: inner.live.len(),
            tracked_records: inner.live.len() + inner.released.len(),
            system: inner.last_sample.clone(),
            forced_allocations: inner.forced,
            refused_allocations: inner.refused,
        }
    }

    /// Drop records not updated within the retention window.
    ///
    /// Returns the number of records removed.
    pub async fn collect_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - retention;
        let mut inner = self.inner.lock().await;
        let before = inner.live.len() + inner.released.len();
        inner.live.retain(|id, u| {
            let keep = u.last_updated >= cutoff;
            if !keep {
                debug!(id = id.as_str(), "Expiring stale allocation");
            }
            keep
        });
        inner.released.retain(|_, u| u.last_updated >= cutoff);
        before - (inner.live.len() + inner.released.len())
    }

    /// Take a telemetry sample, auto-scale, collect expired records, and
    /// append to history. One monitor tick.
    pub async fn sample_and_adjust(&self) {
        if let Some(telemetry) = &self.telemetry {
            match telemetry.sample().await {
                Ok(sample) => self.apply_sample(sample).await,
                Err(e) => warn!(error = %e, "Failed to sample system telemetry"),
            }
        }
        let expired = self.collect_expired().await;
        if expired > 0 {
            debug!(expired, "Cleaned up expired usage records");
        }
        self.record_history().await;
    }

    /// Store a sample and, if enabled, shrink limits under host pressure.
    pub async fn apply_sample(&self, sample: SystemSample) {
        let mut inner = self.inner.lock().await;
        tracing::trace!(
            cpu = sample.cpu_percent,
            memory = sample.memory_usage_percent(),
            "Telemetry sample"
        );
        if self.config.auto_scaling {
            let memory_floor = self.config.limits.max_memory_mb * AUTO_SCALE_FLOOR;
            let cpu_floor = self.config.limits.max_cpu_percent * AUTO_SCALE_FLOOR;
            let memory = sample.memory_usage_percent();
            if memory > 85.0 {
                inner.limits.max_memory_mb = (inner.limits.max_memory_mb * 0.8).max(memory_floor);
                warn!(
                    memory_percent = memory,
                    new_limit = inner.limits.max_memory_mb,
                    "High system memory usage; reducing memory limit"
                );
            }
            if sample.cpu_percent > 90.0 {
                inner.limits.max_cpu_percent = (inner.limits.max_cpu_percent * 0.7).max(cpu_floor);
                warn!(
                    cpu_percent = sample.cpu_percent,
                    new_limit = inner.limits.max_cpu_percent,
                    "High CPU usage; reducing CPU limit"
                );
            }
            let agents = inner.committed().agents;
            if agents > inner.limits.max_concurrent_agents {
                let reduced = ((inner.limits.max_concurrent_agents as f64) * 0.8) as u32;
                inner.limits.max_concurrent_agents = reduced.max(2);
                warn!(
                    agents,
                    new_limit = inner.limits.max_concurrent_agents,
                    "Too many concurrent agents; reducing agent limit"
                );
            }
        }
        inner.last_sample = Some(sample);
    }

    async fn record_history(&self) {
        let mut inner = self.inner.lock().await;
        let Some(sample) = inner.last_sample.clone() else {
            return;
        };
        let committed = inner.committed();
        inner.history.push_back(UsageSnapshot {
            timestamp: Utc::now(),
            tokens: committed.tokens,
            memory_mb: committed.memory_mb,
            cpu_percent: sample.cpu_percent,
            agents: committed.agents,
            system_memory_percent: sample.memory_usage_percent(),
        });
        while inner.history.len() > self.config.history_limit {
            inner.history.pop_front();
        }
    }

    pub async fn history(&self) -> Vec<UsageSnapshot> {
        self.inner.lock().await.history.iter().cloned().collect()
    }

    /// Suggested number of concurrent groups for the host right now.
    ///
    /// Advisory only; staging does not consult it.
    pub async fn optimal_concurrency(&self) -> usize {
        let inner = self.inner.lock().await;
        optimal_concurrency_for(inner.last_sample.as_ref(), &inner.limits)
    }

    /// Estimate the budget needed for `task_count` tasks of the given
    /// complexity (1.0 is average).
    pub async fn predict_resource_needs(
        &self,
        task_count: usize,
        complexity: f64,
    ) -> ResourceAllocation {
        let concurrency = self.optimal_concurrency().await;
        let efficiency = if task_count > 1 {
            0.8 + 0.2 / task_count as f64
        } else {
            1.0
        };
        let n = task_count as f64;
        let parallel = task_count.min(concurrency);
        ResourceAllocation {
            tokens: 100.0 * complexity * n * efficiency,
            memory_mb: 50.0 * complexity * n * efficiency,
            cpu_percent: 10.0 * complexity * parallel as f64,
            agents: parallel as u32,
            ..ResourceAllocation::default()
        }
    }

    /// Averages over the most recent history, or `None` with no history.
    pub async fn performance_metrics(&self) -> Option<PerformanceMetrics> {
        let inner = self.inner.lock().await;
        if inner.history.is_empty() {
            return None;
        }
        let recent: Vec<&UsageSnapshot> = inner.history.iter().rev().take(METRICS_WINDOW).collect();
        let n = recent.len() as f64;
        let average_cpu_usage = recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n;
        let average_memory_usage = recent.iter().map(|s| s.system_memory_percent).sum::<f64>() / n;
        let average_concurrent_agents = recent.iter().map(|s| s.agents as f64).sum::<f64>() / n;

        let utilization = inner.utilization();
        Some(PerformanceMetrics {
            average_cpu_usage,
            average_memory_usage,
            average_concurrent_agents,
            resource_efficiency: efficiency_score(&utilization, inner.last_sample.is_some()),
            optimization_opportunities: optimization_opportunities(
                &utilization,
                inner.last_sample.as_ref(),
            ),
        })
    }
}

fn optimal_concurrency_for(sample: Option<&SystemSample>, limits: &ResourceLimits) -> usize {
    let Some(sample) = sample else {
        return DEFAULT_CONCURRENCY;
    };
    let cpu_based = sample.cpu_count.min(6) as f64;
    let load_factor = (1.0 - sample.cpu_percent / 100.0).max(0.0);
    let memory_factor = sample.available_memory_gb().min(1.0);
    let optimal = (cpu_based * load_factor * memory_factor) as usize;
    optimal.clamp(1, (limits.max_concurrent_agents as usize).max(1))
}

/// 100 for 60-70% utilization, scaling down on either side.
fn efficiency_score(util: &UtilizationPercent, has_sample: bool) -> f64 {
    if !has_sample {
        return 50.0;
    }
    let scores: Vec<f64> = [util.tokens, util.memory, util.cpu, util.agents]
        .iter()
        .map(|pct| {
            let u = pct / 100.0;
            if (0.6..=0.7).contains(&u) {
                100.0
            } else if u < 0.6 {
                u / 0.6 * 100.0
            } else {
                (100.0 - (u - 0.7) * 200.0).max(0.0)
            }
        })
        .collect();
    scores.iter().sum::<f64>() / scores.len() as f64
}

fn optimization_opportunities(
    util: &UtilizationPercent,
    sample: Option<&SystemSample>,
) -> Vec<String> {
    let Some(sample) = sample else {
        return Vec::new();
    };
    let mut hints = Vec::new();
    for (name, pct) in [
        ("tokens", util.tokens),
        ("memory", util.memory),
        ("cpu", util.cpu),
        ("agents", util.agents),
    ] {
        if pct < 30.0 {
            hints.push(format!("Increase {} utilization (currently {:.1}%)", name, pct));
        } else if pct > 90.0 {
            hints.push(format!("Consider increasing {} limits (currently {:.1}%)", name, pct));
        }
    }
    if sample.cpu_percent < 30.0 {
        hints.push("CPU underutilized; consider more parallel tasks".to_string());
    }
    if sample.memory_usage_percent() < 40.0 {
        hints.push("Memory underutilized; consider larger task groups".to_string());
    }
    hints
}
