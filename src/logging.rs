//! Logging setup and per-job timing
//!
//! # Features
//!
//! - **env_logger backend**: `RUST_LOG` wins over the configured level
//! - **JSON lines**: optional structured output, one object per record
//! - **Frame spans**: per-job processing time, logged at trace level
//!
//! # Usage
//!
//! ```no_run
//! use hwc_dispatch::config::LogConfig;
//! use hwc_dispatch::logging;
//!
//! logging::init(&LogConfig::default(), false);
//! ```

use log::{trace, LevelFilter};
use serde_json::json;
use std::io::Write;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::LogConfig;
use crate::display::DisplayId;

/// Parses a level name, case-insensitive
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Installs the global logger.
///
/// `debug` forces the default level to `debug`. Returns `false` when a
/// logger was already installed.
pub fn init(config: &LogConfig, debug: bool) -> bool {
    let level = if debug { "debug" } else { config.level.as_str() };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if config.json {
        builder.format(|buf, record| {
            let line = json_line(
                record.level(),
                record.target(),
                &record.args().to_string(),
                unix_millis(),
            );
            writeln!(buf, "{}", line)
        });
    }

    builder.try_init().is_ok()
}

/// Logger for tests; output captured by the harness
pub fn init_for_tests() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn json_line(level: log::Level, target: &str, message: &str, timestamp_ms: u128) -> String {
    json!({
        "ts_ms": timestamp_ms as u64,
        "level": level.as_str(),
        "target": target,
        "msg": message,
    })
    .to_string()
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

/// Times the processing of one job
#[derive(Debug)]
pub struct FrameSpan {
    display: DisplayId,
    sequence: u64,
    start: Instant,
}

impl FrameSpan {
    pub fn start(display: DisplayId, sequence: u64) -> Self {
        Self {
            display,
            sequence,
            start: Instant::now(),
        }
    }

    /// Ends the span and returns its duration
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        trace!(
            "⏱️ display {} job #{} processed in {:.3}ms",
            self.display,
            self.sequence,
            elapsed.as_secs_f64() * 1000.0
        );
        elapsed
    }
}
