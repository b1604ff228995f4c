// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::thread::ThreadId;

use crate::config::Frequency;
use crate::timer::DelayedWork;
use crate::topology::CoreId;

/// The two independent floors a core can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloorKind {
    Migration,
    Input,
}

/// A migration sync request as handed from the coordinator to the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    pub src_core: CoreId,
    pub task_load: u32,
}

#[derive(Default)]
struct PendingSync {
    pending: bool,
    src_core: CoreId,
    task_load: u32,
}

/// Per-core boost record.
///
/// `pending`, `src_core` and `task_load` live behind a short mutex. The two
/// floors are atomics read lock-free by the policy enforcer; a reader may see
/// a value one update behind, which the next re-evaluation corrects.
pub struct CoreSync {
    core: CoreId,
    sync: Mutex<PendingSync>,
    wake: Condvar,
    boost_min: AtomicU32,
    input_boost_min: AtomicU32,
    boost_rem: DelayedWork,
    input_boost_rem: DelayedWork,
    worker: OnceLock<ThreadId>,
}

impl CoreSync {
    pub fn new(core: CoreId, boost_rem: DelayedWork, input_boost_rem: DelayedWork) -> Self {
        Self {
            core,
            sync: Mutex::new(PendingSync::default()),
            wake: Condvar::new(),
            boost_min: AtomicU32::new(0),
            input_boost_min: AtomicU32::new(0),
            boost_rem,
            input_boost_rem,
            worker: OnceLock::new(),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    fn lock(&self) -> MutexGuard<'_, PendingSync> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a sync request, overwriting any request the worker has not
    /// consumed yet, and wake the worker.
    pub fn mark_pending(&self, src_core: CoreId, task_load: u32) {
        let mut sync = self.lock();
        sync.pending = true;
        sync.src_core = src_core;
        sync.task_load = task_load;
        drop(sync);
        self.wake.notify_one();
    }

    /// Read and clear the pending request.
    pub fn take_pending(&self) -> Option<SyncRequest> {
        let mut sync = self.lock();
        if !sync.pending {
            return None;
        }
        sync.pending = false;
        Some(SyncRequest {
            src_core: sync.src_core,
            task_load: sync.task_load,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    /// Block until a request is pending or `stop` is set. Returns `None` on
    /// stop.
    pub fn wait_pending(&self, stop: &AtomicBool) -> Option<SyncRequest> {
        let mut sync = self.lock();
        loop {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            if sync.pending {
                sync.pending = false;
                return Some(SyncRequest {
                    src_core: sync.src_core,
                    task_load: sync.task_load,
                });
            }
            sync = self.wake.wait(sync).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wake a parked worker so it re-checks the stop flag.
    pub fn kick(&self) {
        let _sync = self.lock();
        self.wake.notify_all();
    }

    pub fn floor(&self, kind: FloorKind) -> Frequency {
        match kind {
            FloorKind::Migration => self.boost_min.load(Ordering::Relaxed),
            FloorKind::Input => self.input_boost_min.load(Ordering::Relaxed),
        }
    }

    pub fn set_floor(&self, kind: FloorKind, freq: Frequency) {
        match kind {
            FloorKind::Migration => self.boost_min.store(freq, Ordering::Relaxed),
            FloorKind::Input => self.input_boost_min.store(freq, Ordering::Relaxed),
        }
    }

    /// Effective floor: the larger of the two, 0 when neither is set.
    pub fn effective_floor(&self) -> Frequency {
        self.floor(FloorKind::Migration).max(self.floor(FloorKind::Input))
    }

    pub fn decay(&self, kind: FloorKind) -> &DelayedWork {
        match kind {
            FloorKind::Migration => &self.boost_rem,
            FloorKind::Input => &self.input_boost_rem,
        }
    }

    pub fn set_worker(&self, id: ThreadId) {
        let _ = self.worker.set(id);
    }

    pub fn is_worker(&self, id: ThreadId) -> bool {
        self.worker.get() == Some(&id)
    }
}

/// Arena of per-core records, one for every possible core.
pub struct BoostState {
    cores: Vec<CoreSync>,
}

impl BoostState {
    pub fn new(cores: Vec<CoreSync>) -> Self {
        Self { cores }
    }

    pub fn get(&self, core: CoreId) -> Option<&CoreSync> {
        self.cores.get(core.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreSync> {
        self.cores.iter()
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerWheel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn record(wheel: &TimerWheel, id: u32) -> CoreSync {
        CoreSync::new(
            CoreId::new(id),
            wheel.delayed(format!("boost_rem/{}", id), || {}),
            wheel.delayed(format!("input_boost_rem/{}", id), || {}),
        )
    }

    #[test]
    fn pending_coalesces_to_last_request() {
        let wheel = TimerWheel::new("state-test").unwrap();
        let s = record(&wheel, 2);

        s.mark_pending(CoreId::new(0), 40);
        s.mark_pending(CoreId::new(1), 55);
        s.mark_pending(CoreId::new(3), 90);

        assert_eq!(
            s.take_pending(),
            Some(SyncRequest { src_core: CoreId::new(3), task_load: 90 })
        );
        assert_eq!(s.take_pending(), None);
        wheel.shutdown();
    }

    #[test]
    fn floors_are_independent() {
        let wheel = TimerWheel::new("state-test").unwrap();
        let s = record(&wheel, 0);

        assert_eq!(s.effective_floor(), 0);
        s.set_floor(FloorKind::Migration, 900_000);
        s.set_floor(FloorKind::Input, 1_200_000);
        assert_eq!(s.effective_floor(), 1_200_000);
        s.set_floor(FloorKind::Input, 0);
        assert_eq!(s.effective_floor(), 900_000);
        wheel.shutdown();
    }

    #[test]
    fn wait_pending_wakes_on_request_and_stop() {
        let wheel = TimerWheel::new("state-test").unwrap();
        let s = Arc::new(record(&wheel, 1));
        let stop = Arc::new(AtomicBool::new(false));

        let (s2, stop2) = (Arc::clone(&s), Arc::clone(&stop));
        let waiter = thread::spawn(move || {
            let first = s2.wait_pending(&stop2);
            let second = s2.wait_pending(&stop2);
            (first, second)
        });

        thread::sleep(Duration::from_millis(20));
        s.mark_pending(CoreId::new(0), 70);
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        s.kick();

        let (first, second) = waiter.join().unwrap();
        assert_eq!(first, Some(SyncRequest { src_core: CoreId::new(0), task_load: 70 }));
        assert_eq!(second, None);
        wheel.shutdown();
    }

    #[test]
    fn worker_identity() {
        let wheel = TimerWheel::new("state-test").unwrap();
        let s = record(&wheel, 0);
        let me = thread::current().id();

        assert!(!s.is_worker(me));
        s.set_worker(me);
        assert!(s.is_worker(me));
        wheel.shutdown();
    }

    #[test]
    fn arena_lookup_rejects_out_of_range() {
        let wheel = TimerWheel::new("state-test").unwrap();
        let state = BoostState::new(vec![record(&wheel, 0), record(&wheel, 1)]);

        assert_eq!(state.len(), 2);
        assert!(state.get(CoreId::new(1)).is_some());
        assert!(state.get(CoreId::new(2)).is_none());
        wheel.shutdown();
    }
}
