// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-core migration boost workers.
//!
//! Each possible core gets a `boost_sync/N` thread parked on that core's
//! record. The thread only runs SCHED_FIFO while it is applying a request,
//! so an idle worker never competes with normal tasks.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use anyhow::Result;
use log::{debug, info, trace, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::config::Frequency;
use crate::engine::CpuBoost;
use crate::state::{FloorKind, SyncRequest};
use crate::stats::BoostStats;
use crate::topology::CoreId;

/// Highest SCHED_FIFO priority.
const WORKER_RT_PRIO: i32 = 99;

/// What one worker cycle did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Floor set and decay armed.
    Boosted(Frequency),
    /// Requested frequency is at or below the hardware minimum.
    NoSync(Frequency),
    /// Destination went offline; floor released immediately.
    Offline,
    /// A policy query failed; the cycle was abandoned.
    PolicyError,
    UnknownCore,
}

impl CpuBoost {
    /// Read and clear `core`'s pending request.
    pub fn take_pending(&self, core: CoreId) -> Option<crate::state::SyncRequest> {
        self.state.get(core).and_then(|s| s.take_pending())
    }

    /// Apply a migration boost to `dest` for the captured request.
    pub fn run_boost_migration(&self, dest: CoreId, req: SyncRequest) -> SyncOutcome {
        let Some(s) = self.state.get(dest) else {
            return SyncOutcome::UnknownCore;
        };
        let cfg = self.config.load();

        let src_policy = match self.policy.get_policy(req.src_core) {
            Ok(p) => p,
            Err(e) => {
                debug!("{}: source policy unavailable: {:#}", req.src_core, e);
                BoostStats::inc(&self.stats.policy_errors);
                return SyncOutcome::PolicyError;
            }
        };
        let dest_policy = match self.policy.get_policy(dest) {
            Ok(p) => p,
            Err(e) => {
                debug!("{}: destination policy unavailable: {:#}", dest, e);
                BoostStats::inc(&self.stats.policy_errors);
                return SyncOutcome::PolicyError;
            }
        };

        let mut req_freq = if cfg.load_based_syncs {
            (dest_policy.max as u64 * req.task_load as u64 / 100) as Frequency
        } else {
            src_policy.cur
        };

        if req_freq <= dest_policy.cpuinfo_min {
            debug!("No sync. Sync Freq:{}", req_freq);
            BoostStats::inc(&self.stats.sync_none);
            return SyncOutcome::NoSync(req_freq);
        }

        if cfg.sync_threshold != 0 {
            req_freq = req_freq.min(cfg.sync_threshold);
        }
        req_freq = req_freq.min(dest_policy.max);

        let decay = s.decay(FloorKind::Migration);
        decay.cancel_sync();
        s.set_floor(FloorKind::Migration, req_freq);

        // Nudge the source governor as well: its floor is unchanged, but it
        // resamples on the next tick instead of waiting out its min sample time.
        if self.policy.is_online(req.src_core) {
            self.policy.request_policy_reevaluation(req.src_core);
        }

        if !self.policy.is_online(dest) {
            s.set_floor(FloorKind::Migration, 0);
            BoostStats::inc(&self.stats.sync_offline);
            return SyncOutcome::Offline;
        }

        self.policy.request_policy_reevaluation(dest);
        if let Err(e) = decay.schedule(cfg.boost_duration()) {
            warn!("{}: cannot arm boost removal: {:#}", dest, e);
        }
        trace!("{} -> {}: sync boost {} kHz", req.src_core, dest, req_freq);
        BoostStats::inc(&self.stats.sync_boosts);
        SyncOutcome::Boosted(req_freq)
    }
}

#[derive(Clone, Copy, Debug)]
enum WorkerPrio {
    Fifo,
    Normal,
}

fn set_worker_prio(prio: WorkerPrio) -> std::io::Result<()> {
    let (policy, priority) = match prio {
        WorkerPrio::Fifo => (libc::SCHED_FIFO, WORKER_RT_PRIO),
        WorkerPrio::Normal => (libc::SCHED_OTHER, 0),
    };
    let param = libc::sched_param {
        sched_priority: priority,
    };

    // SAFETY: pid 0 targets the calling thread and `param` outlives the call.
    let ret = unsafe { libc::sched_setscheduler(0, policy, &param) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn pin_to_core(core: CoreId) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(core.index())
        .with_context(|| format!("{} does not fit in a CpuSet", core))?;
    sched_setaffinity(Pid::from_raw(0), &set)
        .with_context(|| format!("failed to pin worker to {}", core))?;
    Ok(())
}

pub(crate) fn spawn_worker(engine: &Arc<CpuBoost>, core: CoreId) -> Result<JoinHandle<()>> {
    let engine_copy = Arc::clone(engine);
    let handle = thread::Builder::new()
        .name(format!("boost_sync/{}", core.index()))
        .spawn(move || worker_loop(engine_copy, core))
        .with_context(|| format!("failed to spawn worker for {}", core))?;

    if let Some(s) = engine.state.get(core) {
        s.set_worker(handle.thread().id());
    }
    Ok(handle)
}

fn worker_loop(engine: Arc<CpuBoost>, core: CoreId) {
    let Some(s) = engine.state.get(core) else {
        return;
    };

    if engine.config.load().pin_workers {
        if let Err(e) = pin_to_core(core) {
            debug!("boost_sync/{}: {:#}", core.index(), e);
        }
    }

    let mut rt_warned = false;
    while let Some(req) = s.wait_pending(&engine.stop) {
        let rt = engine.config.load().rt_workers;
        if rt {
            if let Err(e) = set_worker_prio(WorkerPrio::Fifo) {
                if !rt_warned {
                    warn!("boost_sync/{}: cannot switch to SCHED_FIFO: {}", core.index(), e);
                    rt_warned = true;
                }
            }
        }

        trace!("Migration sync: {} --> {}", req.src_core, core);
        engine.run_boost_migration(core, req);

        if rt {
            let _ = set_worker_prio(WorkerPrio::Normal);
        }
    }

    info!("boost_sync/{}: stopped", core.index());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostConfig;
    use crate::engine::tests::{engine_with, wait_for};
    use crate::migration::MigrationEvent;

    fn req(src: u32, load: u32) -> SyncRequest {
        SyncRequest {
            src_core: CoreId::new(src),
            task_load: load,
        }
    }

    fn load_based(boost_ms: u32, sync_threshold: Frequency) -> BoostConfig {
        BoostConfig {
            boost_ms,
            sync_threshold,
            load_based_syncs: true,
            rt_workers: false,
            pin_workers: false,
            ..Default::default()
        }
    }

    #[test]
    fn load_based_request_with_cap() {
        let (engine, mock) = engine_with(load_based(10_000, 800), 2);
        mock.with_core(1, |c| {
            c.max = 1800;
            c.cpuinfo_max = 1800;
            c.cpuinfo_min = 300;
            c.base_min = 300;
        });

        let out = engine.run_boost_migration(CoreId::new(1), req(0, 50));
        assert_eq!(out, SyncOutcome::Boosted(800));
        assert_eq!(engine.floors(CoreId::new(1)), Some((800, 0)));
        assert_eq!(mock.core(1).applied_min, 800);
        engine.stop();
    }

    #[test]
    fn load_based_request_without_cap() {
        let (engine, mock) = engine_with(load_based(10_000, 0), 2);
        mock.with_core(1, |c| {
            c.max = 1800;
            c.cpuinfo_min = 300;
            c.base_min = 300;
        });

        let out = engine.run_boost_migration(CoreId::new(1), req(0, 50));
        assert_eq!(out, SyncOutcome::Boosted(900));
        assert_eq!(mock.core(1).applied_min, 900);
        engine.stop();
    }

    #[test]
    fn mirrors_source_frequency_without_load() {
        let cfg = BoostConfig { load_based_syncs: false, ..load_based(10_000, 0) };
        let (engine, mock) = engine_with(cfg, 2);
        mock.with_core(0, |c| c.cur = 1_400_000);

        let out = engine.run_boost_migration(CoreId::new(1), req(0, 0));
        assert_eq!(out, SyncOutcome::Boosted(1_400_000));
        // Source nudged once, destination re-evaluated once.
        assert_eq!(mock.reevaluations(0), 1);
        assert_eq!(mock.reevaluations(1), 1);
        engine.stop();
    }

    #[test]
    fn floor_never_exceeds_destination_max() {
        let cfg = BoostConfig { load_based_syncs: false, ..load_based(10_000, 0) };
        let (engine, mock) = engine_with(cfg, 2);
        mock.with_core(0, |c| c.cur = 2_200_000);
        mock.with_core(1, |c| c.max = 1_500_000);

        let out = engine.run_boost_migration(CoreId::new(1), req(0, 0));
        assert_eq!(out, SyncOutcome::Boosted(1_500_000));
        assert_eq!(engine.floors(CoreId::new(1)), Some((1_500_000, 0)));
        engine.stop();
    }

    #[test]
    fn no_boost_at_or_below_hardware_minimum() {
        let (engine, mock) = engine_with(load_based(10_000, 0), 2);
        mock.with_core(1, |c| {
            c.max = 1000;
            c.cpuinfo_min = 300;
        });

        // 1000 * 30 / 100 == 300 == cpuinfo_min
        let out = engine.run_boost_migration(CoreId::new(1), req(0, 30));
        assert_eq!(out, SyncOutcome::NoSync(300));
        assert_eq!(engine.floors(CoreId::new(1)), Some((0, 0)));
        assert_eq!(mock.total_reevaluations(), 0);
        engine.stop();
    }

    #[test]
    fn offline_destination_releases_floor() {
        let (engine, mock) = engine_with(load_based(10_000, 0), 2);
        mock.with_core(1, |c| c.online = false);

        let out = engine.run_boost_migration(CoreId::new(1), req(0, 80));
        assert_eq!(out, SyncOutcome::Offline);
        assert_eq!(engine.floors(CoreId::new(1)), Some((0, 0)));
        let s = engine.state.get(CoreId::new(1)).unwrap();
        assert!(!s.decay(FloorKind::Migration).is_pending());
        assert_eq!(mock.reevaluations(1), 0);
        engine.stop();
    }

    #[test]
    fn policy_failure_aborts_cycle() {
        let (engine, mock) = engine_with(load_based(10_000, 0), 2);
        mock.with_core(0, |c| c.fail = true);

        assert_eq!(engine.run_boost_migration(CoreId::new(1), req(0, 80)), SyncOutcome::PolicyError);
        assert_eq!(engine.floors(CoreId::new(1)), Some((0, 0)));
        assert_eq!(engine.metrics().policy_errors, 1);
        assert_eq!(
            engine.run_boost_migration(CoreId::new(5), req(0, 80)),
            SyncOutcome::UnknownCore
        );
        engine.stop();
    }

    #[test]
    fn boost_decays_with_single_reevaluation() {
        let (engine, mock) = engine_with(load_based(30, 0), 2);

        assert!(matches!(
            engine.run_boost_migration(CoreId::new(1), req(0, 80)),
            SyncOutcome::Boosted(_)
        ));
        assert_eq!(mock.reevaluations(1), 1);

        assert!(wait_for(|| engine.floors(CoreId::new(1)) == Some((0, 0))));
        assert!(wait_for(|| mock.reevaluations(1) == 2));
        std::thread::sleep(std::time::Duration::from_millis(80));
        assert_eq!(mock.reevaluations(1), 2);
        assert_eq!(mock.core(1).applied_min, mock.core(1).base_min);
        assert_eq!(engine.metrics().boost_removals, 1);
        engine.stop();
    }

    #[test]
    fn new_boost_is_not_clobbered_by_old_decay() {
        let (engine, _mock) = engine_with(load_based(40, 0), 2);

        engine.run_boost_migration(CoreId::new(1), req(0, 60));
        engine.update_config(load_based(10_000, 0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let out = engine.run_boost_migration(CoreId::new(1), req(0, 90));

        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(out, SyncOutcome::Boosted(1_620_000));
        assert_eq!(engine.floors(CoreId::new(1)), Some((1_620_000, 0)));
        engine.stop();
    }

    #[test]
    fn worker_thread_applies_queued_migration() {
        let (engine, mock) = engine_with(load_based(10_000, 0), 4);
        engine.start();

        let ev = MigrationEvent {
            src_core: CoreId::new(0),
            dest_core: CoreId::new(2),
            load: 50,
        };
        engine.on_migration(ev).unwrap();

        assert!(wait_for(|| engine.floors(CoreId::new(2)) == Some((900_000, 0))));
        assert!(wait_for(|| mock.core(2).applied_min == 900_000));
        engine.stop();
        assert_eq!(engine.floors(CoreId::new(2)), Some((0, 0)));
    }
}
