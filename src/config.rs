use crate::device::capabilities::Precision;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level clipflow configuration, layered from an optional config file and
/// `CLIPFLOW_*` environment variables.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Defaults applied to jobs that do not carry their own ProcessingConfig.
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    /// GPUs whose *total* memory is below this limit are excluded from the
    /// registry entirely at scan time. Conservative policy inherited from the
    /// original deployment; the scorer separately disqualifies on available
    /// memory per workload.
    #[serde(default = "default_memory_limit_gb")]
    pub memory_limit_gb: f64,
    /// Total memory credited to the CPU device. System RAM is assumed
    /// sufficient for the workloads this crate schedules.
    #[serde(default = "default_cpu_memory_gb")]
    pub cpu_memory_gb: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    /// Sampling interval for the performance monitor, clamped to 1..=5s.
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Ring buffer capacity per device; oldest sample evicted on overflow.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sample_interval_secs.clamp(1, 5))
    }
}

/// Per-job processing options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_use_gpu")]
    pub use_gpu: bool,
    /// Preferred GPU index when `use_gpu` is set. Selection falls through to
    /// scoring if the device is absent or disqualified.
    #[serde(default)]
    pub gpu_device_id: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    /// Minimum acceptable total device memory for GPU candidates.
    #[serde(default = "default_memory_limit_gb")]
    pub memory_limit_gb: f64,
    #[serde(default = "default_fallback_to_cpu")]
    pub fallback_to_cpu: bool,
}

fn default_memory_limit_gb() -> f64 {
    3.8
}

fn default_cpu_memory_gb() -> f64 {
    16.0
}

fn default_sample_interval_secs() -> u64 {
    1
}

fn default_history_capacity() -> usize {
    100
}

fn default_use_gpu() -> bool {
    true
}

fn default_batch_size() -> usize {
    4
}

fn default_precision() -> Precision {
    Precision::Fp16
}

fn default_fallback_to_cpu() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_limit_gb: default_memory_limit_gb(),
            cpu_memory_gb: default_cpu_memory_gb(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            use_gpu: default_use_gpu(),
            gpu_device_id: 0,
            batch_size: default_batch_size(),
            precision: default_precision(),
            memory_limit_gb: default_memory_limit_gb(),
            fallback_to_cpu: default_fallback_to_cpu(),
        }
    }
}

impl ProcessingConfig {
    /// Reject configs the pipeline cannot honor before any work starts.
    pub fn validate(&self) -> Result<(), crate::error::StageError> {
        if self.batch_size == 0 {
            return Err(crate::error::StageError::Config(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.memory_limit_gb < 0.0 {
            return Err(crate::error::StageError::Config(format!(
                "memory_limit_gb must be non-negative, got {}",
                self.memory_limit_gb
            )));
        }
        Ok(())
    }
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("clipflow"))
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {config_path:?} not found");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("clipflow.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("CLIPFLOW")
                .separator("_")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device.memory_limit_gb, 3.8);
        assert_eq!(config.monitor.history_capacity, 100);
        assert!(config.processing.use_gpu);
        assert!(config.processing.fallback_to_cpu);
        assert_eq!(config.processing.batch_size, 4);
    }

    #[test]
    fn test_sample_interval_clamped() {
        let monitor = MonitorConfig {
            sample_interval_secs: 30,
            history_capacity: 100,
        };
        assert_eq!(monitor.sample_interval().as_secs(), 5);

        let monitor = MonitorConfig {
            sample_interval_secs: 0,
            history_capacity: 100,
        };
        assert_eq!(monitor.sample_interval().as_secs(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = ProcessingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
