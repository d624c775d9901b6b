//! Resource vectors, allocation requests, and usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::time::Duration;

use crate::config::ResourceLimits;

/// Normalized estimate of tokens, memory, and CPU, each a fraction of the
/// configured budget.
///
/// The analyzer works entirely in these units; the orchestrator converts
/// to absolute units with [`ResourceVector::to_absolute`] before asking the
/// resource manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub tokens: f64,
    pub memory: f64,
    pub cpu: f64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        tokens: 0.0,
        memory: 0.0,
        cpu: 0.0,
    };

    pub fn new(tokens: f64, memory: f64, cpu: f64) -> Self {
        Self {
            tokens,
            memory,
            cpu,
        }
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.tokens * factor, self.memory * factor, self.cpu * factor)
    }

    /// Componentwise maximum.
    pub fn max(&self, other: &Self) -> Self {
        Self::new(
            self.tokens.max(other.tokens),
            self.memory.max(other.memory),
            self.cpu.max(other.cpu),
        )
    }

    /// True if every component is at most `limit`.
    pub fn fits_within(&self, limit: f64) -> bool {
        const EPS: f64 = 1e-9;
        self.tokens <= limit + EPS && self.memory <= limit + EPS && self.cpu <= limit + EPS
    }

    /// Largest component.
    pub fn peak(&self) -> f64 {
        self.tokens.max(self.memory).max(self.cpu)
    }

    /// Convert to an absolute allocation request against `limits`.
    pub fn to_absolute(&self, limits: &ResourceLimits) -> ResourceAllocation {
        ResourceAllocation {
            tokens: self.tokens * limits.max_tokens,
            memory_mb: self.memory * limits.max_memory_mb,
            cpu_percent: self.cpu * limits.max_cpu_percent,
            agents: 1,
            ..ResourceAllocation::default()
        }
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: Self) -> Self::Output {
        Self::new(
            self.tokens + rhs.tokens,
            self.memory + rhs.memory,
            self.cpu + rhs.cpu,
        )
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for ResourceVector {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

/// An absolute allocation request or committed amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub tokens: f64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    /// Executor slots.
    pub agents: u32,
    /// 1 (lowest) to 10 (highest).
    pub priority: u8,
    pub timeout: Duration,
}

impl Default for ResourceAllocation {
    fn default() -> Self {
        Self {
            tokens: 0.0,
            memory_mb: 0.0,
            cpu_percent: 0.0,
            agents: 0,
            priority: 5,
            timeout: Duration::from_secs(300),
        }
    }
}

impl ResourceAllocation {
    /// Weighted size of the request: tokens 0.4, memory 0.3, cpu 0.2, slots 0.1.
    ///
    /// Memory is scaled to GB and CPU to a fraction so the components are
    /// roughly comparable.
    pub fn total_score(&self) -> f64 {
        self.tokens * 0.4
            + (self.memory_mb / 1024.0) * 0.3
            + (self.cpu_percent / 100.0) * 0.2
            + self.agents as f64 * 0.1
    }

    /// Componentwise maximum of the consumable resources.
    pub fn max(&self, other: &Self) -> Self {
        Self {
            tokens: self.tokens.max(other.tokens),
            memory_mb: self.memory_mb.max(other.memory_mb),
            cpu_percent: self.cpu_percent.max(other.cpu_percent),
            agents: self.agents.max(other.agents),
            ..*self
        }
    }

    /// Componentwise sum of the consumable resources.
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            tokens: self.tokens + other.tokens,
            memory_mb: self.memory_mb + other.memory_mb,
            cpu_percent: self.cpu_percent + other.cpu_percent,
            agents: self.agents + other.agents,
            ..*self
        }
    }
}

/// Utilization ratios (used / allocated) per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub tokens: f64,
    pub memory: f64,
    pub cpu: f64,
    pub agents: f64,
}

impl Utilization {
    pub fn peak(&self) -> f64 {
        self.tokens.max(self.memory).max(self.cpu).max(self.agents)
    }
}

/// Allocation plus observed usage for one consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub allocated: ResourceAllocation,
    pub used: ResourceAllocation,
    pub peak: ResourceAllocation,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ResourceUsage {
    pub fn new(allocated: ResourceAllocation) -> Self {
        let now = Utc::now();
        let zero = ResourceAllocation {
            priority: allocated.priority,
            timeout: allocated.timeout,
            ..ResourceAllocation::default()
        };
        Self {
            allocated,
            used: zero,
            peak: zero,
            started_at: now,
            last_updated: now,
        }
    }

    /// Record new observed usage and raise the peak.
    pub fn record(&mut self, used: ResourceAllocation) {
        self.used = used;
        self.peak = self.peak.max(&used);
        self.last_updated = Utc::now();
    }

    /// What this consumer counts against the budget.
    pub fn committed(&self) -> ResourceAllocation {
        self.allocated.max(&self.used)
    }

    /// used / allocated for each resource; zero where nothing was allocated.
    pub fn utilization(&self) -> Utilization {
        fn ratio(used: f64, allocated: f64) -> f64 {
            if allocated > 0.0 {
                used / allocated
            } else {
                0.0
            }
        }
        Utilization {
            tokens: ratio(self.used.tokens, self.allocated.tokens),
            memory: ratio(self.used.memory_mb, self.allocated.memory_mb),
            cpu: ratio(self.used.cpu_percent, self.allocated.cpu_percent),
            agents: ratio(self.used.agents as f64, self.allocated.agents as f64),
        }
    }
}
