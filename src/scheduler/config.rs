//! Round timing and the optional `config.toml` that overrides it.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::flood::{FloodConfig, SlowTicks};

/// Slow-clock frequency (Hz).
pub const SLOW_CLOCK_HZ: u64 = 32_768;

/// Round timing, all durations in slow-clock ticks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Nominal round period.
    pub period: SlowTicks,
    /// Length of every flood phase.
    pub flood_duration: SlowTicks,
    /// Early wake-up before the expected config flood once synced.
    pub guard_time: SlowTicks,
    /// Idle time between consecutive phases.
    pub gap: SlowTicks,
    /// Early wake-up while bootstrapping.
    pub init_guard_time: SlowTicks,
    /// Transmissions per node and flood.
    pub retransmissions: u8,
    /// Consecutive captured references needed to leave bootstrap.
    pub bootstrap_periods: u8,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            period: SLOW_CLOCK_HZ * 60,
            flood_duration: SLOW_CLOCK_HZ / 150,
            guard_time: SLOW_CLOCK_HZ / 1900,
            gap: SLOW_CLOCK_HZ / 200,
            init_guard_time: SLOW_CLOCK_HZ / 20,
            retransmissions: 3,
            bootstrap_periods: 3,
        }
    }
}

impl TimingConfig {
    /// Listening window of a bootstrapping node.
    pub fn init_duration(&self) -> SlowTicks {
        self.flood_duration - self.guard_time + self.init_guard_time
    }

    /// Retry interval of a bootstrapping node that heard nothing.
    pub fn init_period(&self) -> SlowTicks {
        self.init_duration() + SLOW_CLOCK_HZ / 100
    }

    /// Start of report phase `index`, relative to the round reference.
    pub fn report_offset(&self, index: usize) -> SlowTicks {
        (index as SlowTicks + 1) * (self.flood_duration + self.gap)
    }

    pub fn validate(&self, report_count: usize) -> Result<(), String> {
        if self.flood_duration == 0 {
            return Err("timing.flood_duration must be positive".into());
        }
        if self.guard_time > self.flood_duration {
            return Err(format!(
                "timing.guard_time ({}) must not exceed timing.flood_duration ({})",
                self.guard_time, self.flood_duration
            ));
        }
        if self.retransmissions == 0 || self.retransmissions > crate::flood::engine::MAX_RETRANSMISSIONS {
            return Err(format!("timing.retransmissions ({}) must be in 1..=16", self.retransmissions));
        }
        let round_length = self.report_offset(report_count) + self.init_guard_time;
        if round_length >= self.period {
            return Err(format!(
                "timing.period ({}) too short for {} report phases ({} ticks needed)",
                self.period, report_count, round_length
            ));
        }
        Ok(())
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub timing: TimingConfig,
    pub flood: FloodConfig,
}

impl ProtocolConfig {
    /// Parse `path` as a `config.toml`. Missing sections and fields keep
    /// their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
        toml::from_str::<Self>(&text).map_err(|e| format!("Invalid timing configuration in {}: {}", path.display(), e))
    }

    /// `config.toml` in the scene file's directory.
    pub fn config_path_from_scene(scene_path: &str) -> PathBuf {
        match Path::new(scene_path).parent() {
            Some(dir) => dir.join("config.toml"),
            None => PathBuf::from("config.toml"),
        }
    }

    /// Load the file next to the scene if there is one, defaults otherwise.
    pub fn load_for_scene(scene_path: &str) -> Result<Self, String> {
        let path = Self::config_path_from_scene(scene_path);
        if !path.exists() {
            log::info!("No configuration file at {:?}, using default timing", path);
            return Ok(Self::default());
        }
        let config = Self::load(&path)?;
        log::info!("Loaded configuration file: {:?}", path);
        Ok(config)
    }

    /// Check both sections for a network with `report_count` report phases.
    pub fn validate(&self, report_count: usize) -> Result<(), String> {
        self.timing.validate(report_count)?;
        self.flood.validate()
    }
}

/// Everything one node's scheduler needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub timing: TimingConfig,
    pub sink_address: u8,
    /// Report order; one phase per entry.
    pub address_table: Vec<u8>,
}
