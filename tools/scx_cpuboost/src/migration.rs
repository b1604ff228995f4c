// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::thread;

use anyhow::bail;
use anyhow::Result;
use log::{error, trace};

use crate::engine::CpuBoost;
use crate::stats::BoostStats;
use crate::topology::CoreId;

/// A task moved from `src_core` to `dest_core`. `load` is the task's
/// utilization in percent as reported by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationEvent {
    pub src_core: CoreId,
    pub dest_core: CoreId,
    pub load: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    LowLoad,
    SameCore,
    Disabled,
    /// The destination's own worker migrated; boosting would wake itself.
    SelfWake,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationDecision {
    Queued,
    Skipped(SkipReason),
}

impl CpuBoost {
    /// Decide whether a migration warrants a sync boost and, if so, hand it
    /// to the destination core's worker. Never blocks on anything but the
    /// destination's short request lock.
    pub fn on_migration(&self, ev: MigrationEvent) -> Result<MigrationDecision> {
        BoostStats::inc(&self.stats.migrations);
        let cfg = self.config.load();

        let skip = |reason: SkipReason| -> Result<MigrationDecision> {
            trace!("{} -> {}: skip {:?}", ev.src_core, ev.dest_core, reason);
            BoostStats::inc(&self.stats.mig_skipped);
            Ok(MigrationDecision::Skipped(reason))
        };

        if cfg.load_based_syncs {
            if ev.load <= cfg.migration_load_threshold as i32 {
                return skip(SkipReason::LowLoad);
            }
            if ev.load > 100 {
                error!("Invalid load: {}", ev.load);
                BoostStats::inc(&self.stats.mig_invalid);
                bail!("invalid task load {}", ev.load);
            }
        } else if ev.src_core == ev.dest_core {
            return skip(SkipReason::SameCore);
        }

        if cfg.boost_ms == 0 {
            return skip(SkipReason::Disabled);
        }

        let Some(dest) = self.state.get(ev.dest_core) else {
            error!("Invalid destination core: {}", ev.dest_core);
            BoostStats::inc(&self.stats.mig_invalid);
            bail!("unknown destination core {}", ev.dest_core);
        };
        if self.state.get(ev.src_core).is_none() {
            error!("Invalid source core: {}", ev.src_core);
            BoostStats::inc(&self.stats.mig_invalid);
            bail!("unknown source core {}", ev.src_core);
        }

        if dest.is_worker(thread::current().id()) {
            return skip(SkipReason::SelfWake);
        }

        let task_load = if cfg.load_based_syncs { ev.load as u32 } else { 0 };
        dest.mark_pending(ev.src_core, task_load);
        BoostStats::inc(&self.stats.mig_queued);
        Ok(MigrationDecision::Queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostConfig;
    use crate::engine::tests::engine_with;
    use crate::state::SyncRequest;

    fn ev(src: u32, dest: u32, load: i32) -> MigrationEvent {
        MigrationEvent {
            src_core: CoreId::new(src),
            dest_core: CoreId::new(dest),
            load,
        }
    }

    fn cfg(load_based: bool) -> BoostConfig {
        BoostConfig {
            boost_ms: 20,
            load_based_syncs: load_based,
            ..Default::default()
        }
    }

    #[test]
    fn coalesces_to_last_request() {
        let (engine, _mock) = engine_with(cfg(true), 4);

        for (src, load) in [(0, 40), (1, 60), (3, 85)] {
            assert_eq!(engine.on_migration(ev(src, 2, load)).unwrap(), MigrationDecision::Queued);
        }
        assert_eq!(
            engine.take_pending(CoreId::new(2)),
            Some(SyncRequest { src_core: CoreId::new(3), task_load: 85 })
        );
        assert_eq!(engine.take_pending(CoreId::new(2)), None);
        assert_eq!(engine.metrics().mig_queued, 3);
        engine.stop();
    }

    #[test]
    fn invalid_load_is_rejected_without_mutation() {
        let (engine, _mock) = engine_with(cfg(true), 2);

        assert!(engine.on_migration(ev(0, 1, 150)).is_err());
        assert_eq!(engine.take_pending(CoreId::new(1)), None);
        assert_eq!(engine.floors(CoreId::new(1)), Some((0, 0)));
        assert_eq!(engine.metrics().mig_invalid, 1);
        engine.stop();
    }

    #[test]
    fn low_load_is_skipped() {
        let (engine, _mock) = engine_with(cfg(true), 2);

        assert_eq!(
            engine.on_migration(ev(0, 1, 30)).unwrap(),
            MigrationDecision::Skipped(SkipReason::LowLoad)
        );
        assert_eq!(
            engine.on_migration(ev(0, 1, -5)).unwrap(),
            MigrationDecision::Skipped(SkipReason::LowLoad)
        );
        assert!(engine.take_pending(CoreId::new(1)).is_none());
        engine.stop();
    }

    #[test]
    fn same_core_only_filtered_without_load() {
        let (engine, _mock) = engine_with(cfg(false), 2);
        assert_eq!(
            engine.on_migration(ev(1, 1, 0)).unwrap(),
            MigrationDecision::Skipped(SkipReason::SameCore)
        );

        assert_eq!(engine.on_migration(ev(0, 1, 0)).unwrap(), MigrationDecision::Queued);
        // Load is not carried in frequency-mirroring mode.
        assert_eq!(
            engine.take_pending(CoreId::new(1)),
            Some(SyncRequest { src_core: CoreId::new(0), task_load: 0 })
        );
        engine.stop();
    }

    #[test]
    fn zero_boost_duration_disables_sync() {
        let c = BoostConfig { boost_ms: 0, ..cfg(true) };
        let (engine, _mock) = engine_with(c, 2);
        assert_eq!(
            engine.on_migration(ev(0, 1, 90)).unwrap(),
            MigrationDecision::Skipped(SkipReason::Disabled)
        );
        engine.stop();
    }

    #[test]
    fn unknown_cores_are_errors() {
        let (engine, _mock) = engine_with(cfg(true), 2);
        assert!(engine.on_migration(ev(0, 8, 90)).is_err());
        assert!(engine.on_migration(ev(8, 1, 90)).is_err());
        assert!(engine.take_pending(CoreId::new(1)).is_none());
        engine.stop();
    }

    #[test]
    fn destination_worker_does_not_wake_itself() {
        let (engine, _mock) = engine_with(cfg(true), 2);
        engine
            .state
            .get(CoreId::new(1))
            .unwrap()
            .set_worker(std::thread::current().id());

        assert_eq!(
            engine.on_migration(ev(0, 1, 90)).unwrap(),
            MigrationDecision::Skipped(SkipReason::SelfWake)
        );
        assert_eq!(engine.on_migration(ev(1, 0, 90)).unwrap(), MigrationDecision::Queued);
        engine.stop();
    }
}
