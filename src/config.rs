use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::ParallelStrategy;
use crate::{Error, Result};

/// Default per-group timeout (30 minutes).
pub const DEFAULT_GROUP_TIMEOUT_SECS: u64 = 1800;

/// Default iteration cap for sequential execution.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Parallelism factor above which hybrid mode chooses parallel execution.
pub const DEFAULT_HYBRID_THRESHOLD: f64 = 1.5;

/// Assumed minutes per task used for speedup reporting.
pub const DEFAULT_MINUTES_PER_TASK: f64 = 5.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Directory for persisted project state. Defaults to `~/.maos/projects`.
    pub state_dir: Option<String>,
}

/// Settings for planning and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub strategy: ParallelStrategy,
    pub group_timeout_secs: u64,
    pub max_iterations: usize,
    pub hybrid_threshold: f64,
    pub assumed_minutes_per_task: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: ParallelStrategy::Balanced,
            group_timeout_secs: DEFAULT_GROUP_TIMEOUT_SECS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            hybrid_threshold: DEFAULT_HYBRID_THRESHOLD,
            assumed_minutes_per_task: DEFAULT_MINUTES_PER_TASK,
        }
    }
}

impl OrchestratorConfig {
    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }
}

/// Hard limits on the shared resource budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_tokens: f64,
    /// Megabytes.
    pub max_memory_mb: f64,
    /// Percent of one host.
    pub max_cpu_percent: f64,
    pub max_concurrent_agents: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_tokens: 10_000.0,
            max_memory_mb: 2048.0,
            max_cpu_percent: 80.0,
            max_concurrent_agents: 8,
        }
    }
}

/// Utilization ratios that trigger warnings and refusals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub warning: f64,
    pub critical: f64,
    pub maximum: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            warning: 0.70,
            critical: 0.85,
            maximum: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub limits: ResourceLimits,
    pub thresholds: ResourceThresholds,
    pub monitoring_interval_secs: u64,
    /// Usage records not updated within this window are dropped.
    pub retention_secs: u64,
    pub auto_scaling: bool,
    pub history_limit: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            thresholds: ResourceThresholds::default(),
            monitoring_interval_secs: 5,
            retention_secs: 3600,
            auto_scaling: true,
            history_limit: 100,
        }
    }
}

impl ResourceConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Config {
    pub fn maos_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maos"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maos_dir()?.join("maos.toml"))
    }

    /// Resolve the directory that holds per-project state folders.
    pub fn projects_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::maos_dir()?.join("projects")),
        }
    }

    /// Load from `~/.maos/maos.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            strategy = %config.orchestrator.strategy,
            group_timeout_secs = config.orchestrator.group_timeout_secs,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                debug!(dir = %parent.display(), "Creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Reject values that would make planning or allocation meaningless.
    pub fn validate(&self) -> Result<()> {
        let t = &self.resources.thresholds;
        if !(0.0 < t.warning && t.warning <= t.critical && t.critical <= t.maximum && t.maximum <= 1.0)
        {
            return Err(Error::Validation(format!(
                "thresholds must satisfy 0 < warning <= critical <= maximum <= 1, got {}/{}/{}",
                t.warning, t.critical, t.maximum
            )));
        }
        let l = &self.resources.limits;
        if l.max_tokens <= 0.0 || l.max_memory_mb <= 0.0 || l.max_cpu_percent <= 0.0 {
            return Err(Error::Validation("resource limits must be positive".into()));
        }
        if l.max_concurrent_agents == 0 {
            return Err(Error::Validation(
                "max_concurrent_agents must be at least 1".into(),
            ));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(Error::Validation("max_iterations must be at least 1".into()));
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
