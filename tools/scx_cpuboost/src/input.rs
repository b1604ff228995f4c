// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Input-driven boosting.
//!
//! Qualifying input events are debounced and collapse into a single global
//! job that raises every online core to `input_boost_freq` for
//! `input_boost_ms`. The job runs on its own `cpuboost-input` thread and at
//! most one instance is ever queued or running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::PoisonError;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};

use crate::engine::CpuBoost;
use crate::state::FloorKind;
use crate::stats::BoostStats;

/// Input devices whose activity triggers a boost.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputProfile {
    /// Multi-touch screen.
    Touchscreen,
    Touchpad,
}

/// The capability bits classification looks at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub abs_mt_position_x: bool,
    pub abs_mt_position_y: bool,
    pub abs_x: bool,
    pub abs_y: bool,
    pub btn_touch: bool,
}

impl InputProfile {
    /// Classify from udev's `ID_INPUT_TOUCHSCREEN` / `ID_INPUT_TOUCHPAD`.
    pub fn from_udev(touchscreen: bool, touchpad: bool) -> Option<Self> {
        if touchscreen {
            Some(Self::Touchscreen)
        } else if touchpad {
            Some(Self::Touchpad)
        } else {
            None
        }
    }

    /// Classify from raw evdev capabilities.
    pub fn from_caps(caps: &DeviceCaps) -> Option<Self> {
        if caps.abs_mt_position_x && caps.abs_mt_position_y {
            return Some(Self::Touchscreen);
        }
        if caps.btn_touch && caps.abs_x && caps.abs_y {
            return Some(Self::Touchpad);
        }
        None
    }
}

enum JobMsg {
    Run,
    Stop,
}

/// Self-exclusive work item. `pending` is set from queueing until the run
/// completes, so triggers arriving while it runs are dropped.
pub struct InputBoostJob {
    pending: AtomicBool,
    tx: Sender<JobMsg>,
    rx: Receiver<JobMsg>,
}

impl Default for InputBoostJob {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBoostJob {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            pending: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue the job unless it is already queued or running.
    pub fn try_queue(&self) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.tx.send(JobMsg::Run).is_err() {
            self.pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn finish(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        let _ = self.tx.send(JobMsg::Stop);
    }
}

impl CpuBoost {
    pub fn on_input_event(&self) -> bool {
        self.on_input_event_at(Instant::now())
    }

    /// Handle one qualifying input event observed at `now`. Returns whether
    /// the event queued a boost.
    pub fn on_input_event_at(&self, now: Instant) -> bool {
        BoostStats::inc(&self.stats.input_events);
        let cfg = self.config.load();
        if self.is_stopped() || !cfg.enabled || cfg.input_boost_freq == 0 {
            return false;
        }

        let mut last = self.last_input.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            if now.saturating_duration_since(prev) < cfg.min_input_interval() {
                BoostStats::inc(&self.stats.input_debounced);
                return false;
            }
        }

        if !self.input_job.try_queue() {
            trace!("input boost already pending");
            return false;
        }
        *last = Some(now);
        BoostStats::inc(&self.stats.input_queued);
        true
    }

    /// Queue the input-boost job on behalf of a non-input trigger, bypassing
    /// the debounce but honoring the pending guard.
    pub(crate) fn queue_boost_at(&self, now: Instant) -> bool {
        if self.is_stopped() || self.config.load().input_boost_freq == 0 {
            return false;
        }
        if !self.input_job.try_queue() {
            return false;
        }
        *self.last_input.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        true
    }

    /// Body of the input-boost job: raise every online core that runs below
    /// the target. Returns the number of cores boosted.
    pub fn run_input_boost(&self) -> usize {
        let cfg = self.config.load();
        let target = cfg.input_boost_freq;
        if target == 0 {
            return 0;
        }

        let mut boosted = 0;
        for core in self.policy.online_cores() {
            let Some(s) = self.state.get(core) else {
                continue;
            };
            let policy = match self.policy.get_policy(core) {
                Ok(p) => p,
                Err(e) => {
                    debug!("{}: policy unavailable: {:#}", core, e);
                    BoostStats::inc(&self.stats.policy_errors);
                    continue;
                }
            };
            if policy.cur >= target {
                continue;
            }

            let decay = s.decay(FloorKind::Input);
            decay.cancel_sync();
            s.set_floor(FloorKind::Input, target.min(policy.max));
            self.policy.request_policy_reevaluation(core);
            if let Err(e) = decay.schedule(cfg.input_boost_duration()) {
                warn!("{}: cannot arm input boost removal: {:#}", core, e);
            }
            boosted += 1;
        }

        if boosted > 0 {
            debug!("Input boost {} kHz on {} cores", target, boosted);
            BoostStats::inc(&self.stats.input_boosts);
        }
        boosted
    }
}

pub(crate) fn spawn_input_job(engine: &Arc<CpuBoost>) -> Result<JoinHandle<()>> {
    let engine = Arc::clone(engine);
    let rx = engine.input_job.rx.clone();
    thread::Builder::new()
        .name("cpuboost-input".into())
        .spawn(move || {
            while let Ok(JobMsg::Run) = rx.recv() {
                if !engine.is_stopped() {
                    engine.run_input_boost();
                }
                engine.input_job.finish();
            }
            info!("cpuboost-input: stopped");
        })
        .context("failed to spawn input boost thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostConfig;
    use crate::engine::tests::{engine_with, wait_for};
    use crate::topology::CoreId;
    use std::time::Duration;

    fn input_cfg() -> BoostConfig {
        BoostConfig {
            enabled: true,
            input_boost_freq: 1_200_000,
            input_boost_ms: 40,
            min_input_interval: 150,
            rt_workers: false,
            pin_workers: false,
            ..Default::default()
        }
    }

    #[test]
    fn classifies_touch_devices() {
        let mt = DeviceCaps {
            abs_mt_position_x: true,
            abs_mt_position_y: true,
            ..Default::default()
        };
        let pad = DeviceCaps {
            btn_touch: true,
            abs_x: true,
            abs_y: true,
            ..Default::default()
        };
        let tablet = DeviceCaps {
            abs_x: true,
            abs_y: true,
            ..Default::default()
        };

        assert_eq!(InputProfile::from_caps(&mt), Some(InputProfile::Touchscreen));
        assert_eq!(InputProfile::from_caps(&pad), Some(InputProfile::Touchpad));
        assert_eq!(InputProfile::from_caps(&tablet), None);
        assert_eq!(InputProfile::from_udev(false, true), Some(InputProfile::Touchpad));
        assert_eq!(InputProfile::from_udev(false, false), None);
    }

    #[test]
    fn debounce_accepts_one_event_per_interval() {
        let (engine, _mock) = engine_with(input_cfg(), 2);
        let t0 = Instant::now();

        assert!(engine.on_input_event_at(t0));
        engine.input_job.finish();
        assert!(!engine.on_input_event_at(t0 + Duration::from_millis(100)));
        assert!(engine.on_input_event_at(t0 + Duration::from_millis(150)));

        let m = engine.metrics();
        assert_eq!(m.input_events, 3);
        assert_eq!(m.input_queued, 2);
        assert_eq!(m.input_debounced, 1);
        engine.stop();
    }

    #[test]
    fn debounce_uses_boost_duration_when_longer() {
        let cfg = BoostConfig { input_boost_ms: 300, ..input_cfg() };
        let (engine, _mock) = engine_with(cfg, 1);
        let t0 = Instant::now();

        assert!(engine.on_input_event_at(t0));
        engine.input_job.finish();
        assert!(!engine.on_input_event_at(t0 + Duration::from_millis(200)));
        assert!(engine.on_input_event_at(t0 + Duration::from_millis(300)));
        engine.stop();
    }

    #[test]
    fn pending_job_drops_new_events() {
        let (engine, _mock) = engine_with(input_cfg(), 1);
        let t0 = Instant::now();

        assert!(engine.on_input_event_at(t0));
        assert!(!engine.on_input_event_at(t0 + Duration::from_secs(1)));
        engine.input_job.finish();
        assert!(engine.on_input_event_at(t0 + Duration::from_secs(2)));
        engine.stop();
    }

    #[test]
    fn disabled_or_zero_target_is_noop() {
        let (engine, _mock) = engine_with(BoostConfig { enabled: false, ..input_cfg() }, 1);
        assert!(!engine.on_input_event());
        assert!(!engine.input_job.is_pending());
        engine.stop();

        let (engine, _mock) = engine_with(BoostConfig { input_boost_freq: 0, ..input_cfg() }, 1);
        assert!(!engine.on_input_event());
        engine.stop();
    }

    #[test]
    fn boosts_only_cores_below_target() {
        let (engine, mock) = engine_with(input_cfg(), 4);
        mock.with_core(1, |c| c.cur = 1_500_000);
        mock.with_core(2, |c| c.online = false);
        mock.with_core(3, |c| c.max = 1_000_000);

        assert_eq!(engine.run_input_boost(), 2);
        assert_eq!(engine.floors(CoreId::new(0)), Some((0, 1_200_000)));
        assert_eq!(engine.floors(CoreId::new(1)), Some((0, 0)));
        assert_eq!(engine.floors(CoreId::new(2)), Some((0, 0)));
        assert_eq!(engine.floors(CoreId::new(3)), Some((0, 1_000_000)));
        assert_eq!(mock.core(0).applied_min, 1_200_000);
        assert_eq!(mock.reevaluations(1), 0);
        engine.stop();
    }

    #[test]
    fn policy_failure_skips_core() {
        let (engine, mock) = engine_with(input_cfg(), 2);
        mock.with_core(0, |c| c.fail = true);

        assert_eq!(engine.run_input_boost(), 1);
        assert_eq!(engine.floors(CoreId::new(0)), Some((0, 0)));
        assert!(engine.input_boost_active(CoreId::new(1)));
        engine.stop();
    }

    #[test]
    fn input_boost_decays() {
        let (engine, mock) = engine_with(input_cfg(), 1);
        engine.run_input_boost();
        assert!(engine.input_boost_active(CoreId::new(0)));

        assert!(wait_for(|| !engine.input_boost_active(CoreId::new(0))));
        assert!(wait_for(|| mock.reevaluations(0) == 2));
        assert_eq!(mock.core(0).applied_min, mock.core(0).base_min);
        engine.stop();
    }

    #[test]
    fn job_thread_runs_and_clears_pending() {
        let cfg = BoostConfig { input_boost_ms: 10_000, ..input_cfg() };
        let (engine, _mock) = engine_with(cfg, 2);
        engine.start();

        assert!(engine.on_input_event());
        assert!(wait_for(|| engine.input_boost_active(CoreId::new(1))));
        assert!(wait_for(|| !engine.input_job.is_pending()));
        engine.stop();
        assert!(!engine.input_boost_active(CoreId::new(1)));
    }
}
