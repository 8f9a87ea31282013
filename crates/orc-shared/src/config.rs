//! Layered configuration, modeled on `tasker-shared::config`:
//! code defaults → optional `orc.toml` → `ORC_`-prefixed environment
//! overrides, loaded through the `config` crate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bound on each per-subscriber queue.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerQueueConfig {
    pub retry_base_ms: u64,
    pub max_retries: u32,
}

impl Default for WorkerQueueConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// The scheduler wakes at most every second for overdue checks.
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the RunningTaskDb snapshot file used for crash recovery.
    pub running_task_db_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            running_task_db_path: "orc_running_tasks.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrcConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub worker_queue: WorkerQueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl OrcConfig {
    /// Load defaults, an optional `orc.toml` in the current directory, and
    /// `ORC_`-prefixed environment overrides (e.g. `ORC_BUS__QUEUE_CAPACITY`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = OrcConfig::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::with_name("orc").required(false))
            .add_source(config::Environment::with_prefix("ORC").separator("__"));
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = OrcConfig::default();
        assert_eq!(cfg.worker_queue.max_retries, 3);
        assert_eq!(cfg.scheduler.tick_interval_ms, 1000);
    }

    #[test]
    fn load_falls_back_to_defaults_without_a_config_file() {
        let cfg = OrcConfig::load().expect("defaults alone must be loadable");
        assert_eq!(cfg.bus.queue_capacity, 256);
    }
}
