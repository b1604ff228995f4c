// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The boost engine: owns the per-core records, the timer thread, the
//! migration workers and the input-boost job, and wires the policy
//! enforcer into the frequency-policy subsystem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Result;
use arc_swap::ArcSwap;
use log::{debug, error, info, warn};

use crate::config::{BoostConfig, Frequency};
use crate::input::{self, InputBoostJob};
use crate::policy::{CpufreqPolicy, PolicyMinEnforcer};
use crate::state::{BoostState, CoreSync, FloorKind};
use crate::stats::{BoostStats, CoreFloors, Metrics};
use crate::timer::TimerWheel;
use crate::topology::CoreId;
use crate::worker;

pub struct CpuBoost {
    pub(crate) config: ArcSwap<BoostConfig>,
    pub(crate) policy: Arc<dyn CpufreqPolicy>,
    pub(crate) state: Arc<BoostState>,
    pub(crate) timers: TimerWheel,
    pub(crate) input_job: InputBoostJob,
    pub(crate) last_input: Mutex<Option<Instant>>,
    pub(crate) stats: BoostStats,
    pub(crate) stop: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuBoost {
    /// Build the engine for `nr_cores` possible cores and register the
    /// policy enforcer with `policy`. No worker runs until [`Self::start`].
    pub fn new(
        config: BoostConfig,
        policy: Arc<dyn CpufreqPolicy>,
        nr_cores: usize,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let timers = TimerWheel::new("cpuboost-timer")?;

        let engine = Arc::new_cyclic(|weak: &Weak<CpuBoost>| {
            let cores = (0..nr_cores)
                .map(|i| {
                    let core = CoreId::new(i as u32);
                    CoreSync::new(
                        core,
                        timers.delayed(format!("boost_rem/{}", i), expiry(weak, core, FloorKind::Migration)),
                        timers.delayed(format!("input_boost_rem/{}", i), expiry(weak, core, FloorKind::Input)),
                    )
                })
                .collect();

            Self {
                config: ArcSwap::from_pointee(config),
                policy,
                state: Arc::new(BoostState::new(cores)),
                timers: timers.clone(),
                input_job: InputBoostJob::new(),
                last_input: Mutex::new(None),
                stats: BoostStats::default(),
                stop: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }
        });

        let enforcer = Arc::new(PolicyMinEnforcer::new(Arc::clone(&engine.state)));
        if let Err(e) = engine.policy.register_adjust_hook(enforcer) {
            error!("Cannot register policy adjust hook: {:#}", e);
        }

        Ok(engine)
    }

    /// Spawn one migration worker per core and the input-boost job thread.
    /// A thread that fails to spawn is logged and its feature stays off.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);

        for s in self.state.iter() {
            match worker::spawn_worker(self, s.core()) {
                Ok(handle) => threads.push(handle),
                Err(e) => error!("Cannot register boost_sync thread for {}: {:#}", s.core(), e),
            }
        }

        match input::spawn_input_job(self) {
            Ok(handle) => threads.push(handle),
            Err(e) => error!("Cannot register input boost job: {:#}", e),
        }

        info!("{} started on {} cores", crate::NAME, self.state.len());
    }

    /// Stop all threads, drop every pending decay and release every floor.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        for s in self.state.iter() {
            s.kick();
        }
        self.input_job.stop();

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("{} thread panicked", crate::NAME);
            }
        }

        for s in self.state.iter() {
            s.decay(FloorKind::Migration).cancel_sync();
            s.decay(FloorKind::Input).cancel_sync();
            let boosted = s.effective_floor() != 0;
            s.set_floor(FloorKind::Migration, 0);
            s.set_floor(FloorKind::Input, 0);
            if boosted && self.policy.is_online(s.core()) {
                self.policy.request_policy_reevaluation(s.core());
            }
        }

        self.timers.shutdown();
        info!("{} stopped", crate::NAME);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn config(&self) -> Arc<BoostConfig> {
        self.config.load_full()
    }

    /// Replace the configuration. Takes effect at the next decision point.
    pub fn update_config(&self, config: BoostConfig) -> Result<()> {
        config.validate()?;
        debug!("config update: {:?}", config);
        self.config.store(Arc::new(config));
        Ok(())
    }

    pub fn nr_cores(&self) -> usize {
        self.state.len()
    }

    /// `(migration floor, input floor)` for `core`.
    pub fn floors(&self, core: CoreId) -> Option<(Frequency, Frequency)> {
        self.state
            .get(core)
            .map(|s| (s.floor(FloorKind::Migration), s.floor(FloorKind::Input)))
    }

    /// Whether an input (or hotplug/wake) boost floor is set on `core`.
    pub fn input_boost_active(&self, core: CoreId) -> bool {
        self.state
            .get(core)
            .is_some_and(|s| s.floor(FloorKind::Input) > 0)
    }

    pub fn metrics(&self) -> Metrics {
        let floors = self
            .state
            .iter()
            .map(|s| CoreFloors {
                cpu: s.core().index() as u64,
                boost_min: s.floor(FloorKind::Migration).into(),
                input_boost_min: s.floor(FloorKind::Input).into(),
            })
            .collect();
        Metrics::snapshot(&self.stats, floors)
    }

    /// Decay callback: clear the floor and let the enforcer observe it.
    fn remove_boost(&self, core: CoreId, kind: FloorKind) {
        let Some(s) = self.state.get(core) else {
            return;
        };
        match kind {
            FloorKind::Migration => debug!("Removing boost for {}", core),
            FloorKind::Input => debug!("Removing input/hotplug boost for {}", core),
        }
        s.set_floor(kind, 0);
        BoostStats::inc(&self.stats.boost_removals);
        self.policy.request_policy_reevaluation(core);
    }
}

impl Drop for CpuBoost {
    fn drop(&mut self) {
        self.timers.shutdown();
    }
}

fn expiry(weak: &Weak<CpuBoost>, core: CoreId, kind: FloorKind) -> impl Fn() + Send + Sync + 'static {
    let weak = weak.clone();
    move || {
        if let Some(engine) = weak.upgrade() {
            engine.remove_boost(core, kind);
        }
    }
}
