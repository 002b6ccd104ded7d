use std::{env, fs::File, io::BufReader, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ProfilerError, ProfilerResult},
    schema::ReportFormat,
};

const DEFAULT_CPU_SAMPLE_INTERVAL_MS: u64 = 1;
const DEFAULT_MEMORY_SAMPLE_INTERVAL_MS: u64 = 100;

/// Options recognized by [`crate::profiler::Profiler`]. Every field is
/// optional in a JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfilerConfig {
    #[serde(rename = "enableCPU")]
    pub enable_cpu: bool,
    pub enable_memory: bool,
    pub enable_network: bool,
    /// Milliseconds between CPU samples.
    pub cpu_sample_interval: u64,
    /// Milliseconds between heap snapshots.
    pub memory_sample_interval: u64,
    pub auto_report: bool,
    pub report_format: ReportFormat,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enable_cpu: true,
            enable_memory: true,
            enable_network: true,
            cpu_sample_interval: DEFAULT_CPU_SAMPLE_INTERVAL_MS,
            memory_sample_interval: DEFAULT_MEMORY_SAMPLE_INTERVAL_MS,
            auto_report: false,
            report_format: ReportFormat::default(),
        }
    }
}

impl ProfilerConfig {
    /// Defaults overlaid with the `PROFILER_*` environment variables.
    /// Values that fail to parse keep their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(default)
        };

        Self {
            enable_cpu: flag("PROFILER_ENABLE_CPU", defaults.enable_cpu),
            enable_memory: flag("PROFILER_ENABLE_MEMORY", defaults.enable_memory),
            enable_network: flag("PROFILER_ENABLE_NETWORK", defaults.enable_network),
            cpu_sample_interval: lookup("PROFILER_CPU_SAMPLE_INTERVAL_MS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.cpu_sample_interval),
            memory_sample_interval: lookup("PROFILER_MEMORY_SAMPLE_INTERVAL_MS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.memory_sample_interval),
            auto_report: flag("PROFILER_AUTO_REPORT", defaults.auto_report),
            report_format: lookup("PROFILER_REPORT_FORMAT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.report_format),
        }
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> ProfilerResult<Self> {
        let file = File::open(path)?;
        let config: Self = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProfilerResult<()> {
        if self.enable_cpu && self.cpu_sample_interval == 0 {
            return Err(ProfilerError::InvalidConfig(
                "cpuSampleInterval must be at least 1 ms".to_string(),
            ));
        }
        if self.enable_memory && self.memory_sample_interval == 0 {
            return Err(ProfilerError::InvalidConfig(
                "memorySampleInterval must be at least 1 ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cpu_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_interval)
    }

    pub fn memory_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
