// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::Arc;

use anyhow::Result;
use log::trace;

use crate::config::Frequency;
use crate::state::BoostState;
use crate::topology::CoreId;

/// Snapshot of a core's frequency policy, all values in kHz.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreqPolicy {
    pub cpu: CoreId,
    pub min: Frequency,
    pub max: Frequency,
    pub cur: Frequency,
    /// Lowest frequency the hardware supports.
    pub cpuinfo_min: Frequency,
    pub cpuinfo_max: Frequency,
}

impl FreqPolicy {
    /// Clamp the policy bounds into `[min, max]`.
    pub fn verify_within_limits(&mut self, min: Frequency, max: Frequency) {
        self.min = self.min.clamp(min, max);
        self.max = self.max.clamp(min, max);
    }
}

/// Hook run by the policy subsystem while it finalizes a policy.
pub trait PolicyAdjust: Send + Sync {
    fn adjust(&self, policy: &mut FreqPolicy);
}

/// The frequency-policy subsystem as seen by the boost engine.
pub trait CpufreqPolicy: Send + Sync {
    fn get_policy(&self, core: CoreId) -> Result<FreqPolicy>;

    /// Recompute the policy for `core`, running the registered adjust hook
    /// synchronously before the result is committed.
    fn request_policy_reevaluation(&self, core: CoreId);

    fn is_online(&self, core: CoreId) -> bool;

    fn online_cores(&self) -> Vec<CoreId>;

    fn register_adjust_hook(&self, hook: Arc<dyn PolicyAdjust>) -> Result<()>;
}

/// Raises a policy's minimum to the core's active boost floor.
pub struct PolicyMinEnforcer {
    state: Arc<BoostState>,
}

impl PolicyMinEnforcer {
    pub fn new(state: Arc<BoostState>) -> Self {
        Self { state }
    }
}

impl PolicyAdjust for PolicyMinEnforcer {
    fn adjust(&self, policy: &mut FreqPolicy) {
        let Some(s) = self.state.get(policy.cpu) else {
            return;
        };

        let floor = s.effective_floor();
        if floor == 0 {
            return;
        }

        let min = floor.min(policy.max);
        trace!("{} policy min before boost: {} kHz", policy.cpu, policy.min);
        policy.verify_within_limits(min, Frequency::MAX);
        trace!("{} policy min after boost: {} kHz", policy.cpu, policy.min);
    }
}
