//! Configuration management for hwc-dispatch
//!
//! Runtime-tunable policy values of the dispatch pipeline, loaded from a
//! TOML file. Every section is optional and falls back to its defaults.
//!
//! ```toml
//! [queue]
//! low_watermark = 2
//! high_watermark = 5
//! outbox_limit = 256
//!
//! [pool]
//! size = 5
//!
//! [vsync]
//! paced = true
//! period_us = 16667
//! tolerance_us = 2000
//!
//! [cpu]
//! enabled = true
//! little_cpus = [0, 1, 2, 3]
//! big_cpus = [4, 5, 6, 7]
//! big_nice = -4
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::parse_level;

/// Main configuration struct containing all dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DispatchConfig {
    /// Dispatch worker FIFO watermarks
    #[serde(default)]
    pub queue: QueueConfig,

    /// Job pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Vsync pacing and mirror wait window
    #[serde(default)]
    pub vsync: VsyncConfig,

    /// Worker CPU placement per job class
    #[serde(default)]
    pub cpu: CpuConfig,

    /// Hardware-resource assignment
    #[serde(default)]
    pub hrt: HrtConfig,

    /// Logger setup
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Above this depth a vsync-paced display drops new frames
    #[serde(default = "QueueConfig::default_low_watermark")]
    pub low_watermark: usize,

    /// Above this depth `enqueue` drains the worker first
    #[serde(default = "QueueConfig::default_high_watermark")]
    pub high_watermark: usize,

    /// Uncollected release, present and retire fences kept per display;
    /// the oldest are closed beyond this
    #[serde(default = "QueueConfig::default_outbox_limit")]
    pub outbox_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Jobs allocated per display
    #[serde(default = "PoolConfig::default_size")]
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VsyncConfig {
    /// Displays start out paced by vsync
    pub paced: bool,

    /// Refresh period in microseconds
    pub period_us: u64,

    /// Extra time a mirror sink waits for its source beyond one period
    pub tolerance_us: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    /// Apply affinity and priority at all
    pub enabled: bool,

    /// CPUs of the `little` class
    pub little_cpus: Vec<usize>,

    /// CPUs of the `big` class
    pub big_cpus: Vec<usize>,

    /// Nice value of the `default` class
    pub default_nice: i32,

    pub little_nice: i32,

    pub big_nice: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HrtConfig {
    /// Use the manager's placement query when it offers one
    pub detailed_query: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// One JSON object per line instead of the human format
    pub json: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            low_watermark: Self::default_low_watermark(),
            high_watermark: Self::default_high_watermark(),
            outbox_limit: Self::default_outbox_limit(),
        }
    }
}

impl QueueConfig {
    fn default_low_watermark() -> usize {
        2
    }

    fn default_high_watermark() -> usize {
        5
    }

    fn default_outbox_limit() -> usize {
        256
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: Self::default_size(),
        }
    }
}

impl PoolConfig {
    fn default_size() -> usize {
        crate::pool::DEFAULT_POOL_SIZE
    }
}

impl Default for VsyncConfig {
    fn default() -> Self {
        Self {
            paced: true,
            period_us: 16_667, // 60Hz
            tolerance_us: 2_000,
        }
    }
}

impl VsyncConfig {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }

    /// How long a mirror sink waits for its source's output
    pub fn mirror_wait(&self) -> Duration {
        Duration::from_micros(self.period_us + self.tolerance_us)
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            little_cpus: Vec::new(),
            big_cpus: Vec::new(),
            default_nice: 0,
            little_nice: 0,
            big_nice: -4,
        }
    }
}

impl Default for HrtConfig {
    fn default() -> Self {
        Self {
            detailed_query: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DispatchConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.high_watermark == 0 {
            anyhow::bail!("Invalid high_watermark: must be at least 1");
        }
        if self.queue.low_watermark > self.queue.high_watermark {
            anyhow::bail!(
                "Invalid watermarks: low ({}) exceeds high ({})",
                self.queue.low_watermark,
                self.queue.high_watermark
            );
        }

        if self.queue.outbox_limit == 0 {
            anyhow::bail!("Invalid outbox_limit: must be at least 1");
        }

        if self.pool.size == 0 {
            anyhow::bail!("Invalid pool size: must be at least 1");
        }

        if self.vsync.period_us == 0 {
            anyhow::bail!("Invalid vsync period: must be positive");
        }
        if self.vsync.tolerance_us > self.vsync.period_us {
            anyhow::bail!("Invalid vsync tolerance: must not exceed one period");
        }

        for nice in [self.cpu.default_nice, self.cpu.little_nice, self.cpu.big_nice] {
            if !(-20..=19).contains(&nice) {
                anyhow::bail!("Invalid nice value {}: must be between -20 and 19", nice);
            }
        }
        if let Some(cpu) = self
            .cpu
            .little_cpus
            .iter()
            .chain(&self.cpu.big_cpus)
            .find(|&&cpu| cpu >= 1024)
        {
            anyhow::bail!("Invalid cpu index {}: must be below 1024", cpu);
        }

        if parse_level(&self.logging.level).is_none() {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}


#[cfg(test)]
mod property_tests;
