// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::time::Instant;

use log::debug;

use crate::engine::CpuBoost;
use crate::stats::BoostStats;
use crate::topology::CoreId;

impl CpuBoost {
    /// A core came online: reuse the input-boost job so the new core (and
    /// the rest) ramp up while load rebalances onto it.
    pub fn on_core_online(&self, core: CoreId) -> bool {
        if !self.config.load().hotplug_boost {
            return false;
        }
        if !self.queue_boost_at(Instant::now()) {
            return false;
        }
        debug!("Hotplug boost for {}", core);
        BoostStats::inc(&self.stats.hotplug_boosts);
        true
    }

    /// The display woke up.
    pub fn on_display_wake(&self) -> bool {
        if !self.config.load().wake_boost {
            return false;
        }
        if !self.queue_boost_at(Instant::now()) {
            return false;
        }
        debug!("Wake boost");
        BoostStats::inc(&self.stats.wake_boosts);
        true
    }
}
