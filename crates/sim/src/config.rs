//! JSON-loadable simulation run configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use kestrel_uhf::{ChannelParams, TimerConfig, UhfConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub uhf: UhfConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub channel: ChannelParams,
    /// Wall-clock length of the beacon observation window.
    #[serde(default = "default_run_secs")]
    pub run_secs: u64,
}

fn default_run_secs() -> u64 {
    8
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            uhf: UhfConfig::default(),
            timers: TimerConfig::default(),
            channel: ChannelParams::default(),
            run_secs: default_run_secs(),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let raw = r#"{ "run_secs": 3, "timers": {
            "beacon_enable_ms": 1000,
            "beacon_period_ms": 2000,
            "beacon_repeat_ms": 100,
            "repeat_count": 1,
            "telemetry_read_ms": 4000
        } }"#;
        let config: BenchConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.run_secs, 3);
        assert_eq!(config.timers.beacon_period_ms, 2000);
        assert_eq!(config.uhf.command_retries, UhfConfig::default().command_retries);
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = BenchConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let back: BenchConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.timers, config.timers);
        assert_eq!(back.run_secs, config.run_secs);
    }
}
