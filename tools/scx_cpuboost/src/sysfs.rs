// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! cpufreq policy backend on top of `/sys/devices/system/cpu`.
//!
//! The kernel has no hook for userspace to adjust a policy while it is being
//! finalized, so re-evaluation is done here: the policy is rebuilt from the
//! user's own `scaling_min_freq` (captured the first time a core is touched),
//! the registered hook adjusts it and the resulting minimum is written back.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::{debug, trace};

use crate::config::Frequency;
use crate::policy::{CpufreqPolicy, FreqPolicy, PolicyAdjust};
use crate::topology::{read_cpu_list, CoreId};

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

pub struct SysfsCpufreq {
    root: PathBuf,
    baseline: Mutex<HashMap<CoreId, Frequency>>,
    hook: OnceLock<Arc<dyn PolicyAdjust>>,
    /// Held from reading the policy until `scaling_min_freq` is written, so
    /// the last re-evaluation to start is the last to write.
    update: Mutex<()>,
}

fn read_freq(path: &Path) -> Result<Frequency> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .trim()
        .parse::<Frequency>()
        .with_context(|| format!("Invalid frequency in {}: {:?}", path.display(), content.trim()))
}

impl SysfsCpufreq {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            baseline: Mutex::new(HashMap::new()),
            hook: OnceLock::new(),
            update: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn possible_cores(&self) -> Result<Vec<CoreId>> {
        read_cpu_list(&self.root.join("possible"))
    }

    fn cpufreq_file(&self, core: CoreId, name: &str) -> PathBuf {
        self.root
            .join(format!("cpu{}", core.index()))
            .join("cpufreq")
            .join(name)
    }

    /// The core's `scaling_min_freq` as it was before this process first
    /// touched it.
    fn baseline_min(&self, core: CoreId) -> Result<Frequency> {
        let mut baseline = self.baseline.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&min) = baseline.get(&core) {
            return Ok(min);
        }
        let min = read_freq(&self.cpufreq_file(core, "scaling_min_freq"))?;
        debug!("{} baseline scaling_min_freq {} kHz", core, min);
        baseline.insert(core, min);
        Ok(min)
    }

    fn reevaluate(&self, core: CoreId) -> Result<()> {
        let _update = self.update.lock().unwrap_or_else(PoisonError::into_inner);
        let mut policy = self.get_policy(core)?;
        let current = policy.min;
        policy.min = self.baseline_min(core)?;
        if let Some(hook) = self.hook.get() {
            hook.adjust(&mut policy);
        }

        if policy.min != current {
            let path = self.cpufreq_file(core, "scaling_min_freq");
            fs::write(&path, policy.min.to_string())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            trace!("{} scaling_min_freq {} -> {} kHz", core, current, policy.min);
        }
        Ok(())
    }
}

impl CpufreqPolicy for SysfsCpufreq {
    fn get_policy(&self, core: CoreId) -> Result<FreqPolicy> {
        self.baseline_min(core)?;
        Ok(FreqPolicy {
            cpu: core,
            min: read_freq(&self.cpufreq_file(core, "scaling_min_freq"))?,
            max: read_freq(&self.cpufreq_file(core, "scaling_max_freq"))?,
            cur: read_freq(&self.cpufreq_file(core, "scaling_cur_freq"))?,
            cpuinfo_min: read_freq(&self.cpufreq_file(core, "cpuinfo_min_freq"))?,
            cpuinfo_max: read_freq(&self.cpufreq_file(core, "cpuinfo_max_freq"))?,
        })
    }

    fn request_policy_reevaluation(&self, core: CoreId) {
        if let Err(e) = self.reevaluate(core) {
            debug!("{} policy re-evaluation failed: {:#}", core, e);
        }
    }

    fn is_online(&self, core: CoreId) -> bool {
        let dir = self.root.join(format!("cpu{}", core.index()));
        match fs::read_to_string(dir.join("online")) {
            Ok(s) => s.trim() == "1",
            // The boot CPU usually cannot be offlined and has no `online` file.
            Err(_) => dir.is_dir(),
        }
    }

    fn online_cores(&self) -> Vec<CoreId> {
        match read_cpu_list(&self.root.join("online")) {
            Ok(cores) => cores,
            Err(e) => {
                debug!("Falling back to per-core online state: {:#}", e);
                self.possible_cores()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|&c| self.is_online(c))
                    .collect()
            }
        }
    }

    fn register_adjust_hook(&self, hook: Arc<dyn PolicyAdjust>) -> Result<()> {
        self.hook
            .set(hook)
            .map_err(|_| anyhow!("policy adjust hook already registered"))
    }
}
