// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Short-lived CPU frequency floor boosts.
//!
//! Three triggers raise a core's minimum frequency for a bounded time:
//!
//! * a task migrating onto a core (the core inherits the source frequency or
//!   a load-scaled share of its own maximum),
//! * touch input (every online core is raised to a fixed target),
//! * a core coming online or the display waking (same as input).
//!
//! Floors are applied through [`policy::CpufreqPolicy`]: the engine registers
//! a [`policy::PolicyMinEnforcer`] hook and asks the policy layer to
//! re-evaluate whenever a floor is set or expires.

pub mod config;
pub mod engine;
pub mod hotplug;
pub mod input;
pub mod migration;
pub mod policy;
pub mod sources;
pub mod state;
pub mod stats;
pub mod sysfs;
pub mod timer;
pub mod topology;
pub mod worker;

pub use config::BoostConfig;
pub use config::Frequency;
pub use engine::CpuBoost;
pub use migration::{MigrationDecision, MigrationEvent, SkipReason};
pub use policy::{CpufreqPolicy, FreqPolicy, PolicyAdjust, PolicyMinEnforcer};
pub use stats::Metrics;
pub use sysfs::SysfsCpufreq;
pub use topology::CoreId;
pub use worker::SyncOutcome;

pub const NAME: &str = "scx_cpuboost";
