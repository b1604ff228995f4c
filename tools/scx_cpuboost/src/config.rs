// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runtime tunables for the boost engine.
//!
//! A [`BoostConfig`] is injected into the engine at construction and replaced
//! wholesale through `CpuBoost::update_config`. Every decision point loads a
//! fresh snapshot, so a new value takes effect on the next event.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Frequency in kHz, the unit used by cpufreq.
pub type Frequency = u32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoostConfig {
    /// Master switch for input-driven boosting.
    pub enabled: bool,
    /// Migration boost duration in ms. 0 disables migration syncs.
    pub boost_ms: u32,
    /// Upper bound on the migration boost frequency (kHz). 0 = no cap.
    pub sync_threshold: Frequency,
    /// Input boost target frequency (kHz). 0 disables input, hotplug and
    /// wake boosts.
    pub input_boost_freq: Frequency,
    /// Input boost duration in ms.
    pub input_boost_ms: u32,
    /// Load-based mode: migrations at or below this load are ignored.
    pub migration_load_threshold: u32,
    /// Scale the destination max by the migrated task's load instead of
    /// mirroring the source frequency.
    pub load_based_syncs: bool,
    pub hotplug_boost: bool,
    pub wake_boost: bool,
    /// Minimum ms between two accepted input boosts.
    pub min_input_interval: u32,
    /// Run migration workers as SCHED_FIFO while they process a request.
    pub rt_workers: bool,
    /// Pin each migration worker to the core it serves.
    pub pin_workers: bool,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            boost_ms: 0,
            sync_threshold: 0,
            input_boost_freq: 0,
            input_boost_ms: 40,
            migration_load_threshold: 30,
            load_based_syncs: true,
            hotplug_boost: true,
            wake_boost: false,
            min_input_interval: 150,
            rt_workers: true,
            pin_workers: true,
        }
    }
}

impl BoostConfig {
    /// Load a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.migration_load_threshold > 100 {
            bail!(
                "migration_load_threshold must be a percentage, got {}",
                self.migration_load_threshold
            );
        }
        Ok(())
    }

    pub fn boost_duration(&self) -> Duration {
        Duration::from_millis(self.boost_ms as u64)
    }

    pub fn input_boost_duration(&self) -> Duration {
        Duration::from_millis(self.input_boost_ms as u64)
    }

    /// Debounce window for input events: an input boost never retriggers
    /// before the previous one could have decayed.
    pub fn min_input_interval(&self) -> Duration {
        Duration::from_millis(self.min_input_interval.max(self.input_boost_ms) as u64)
    }
}
