// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cancellable delayed work on a single timer thread.
//!
//! A [`DelayedWork`] is armed with [`DelayedWork::schedule`] and disarmed with
//! [`DelayedWork::cancel_sync`]. Cancellation also waits for a firing that is
//! already running, under the same mutex that arming uses, so once it returns
//! the callback neither runs nor is due until the work is scheduled again.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

enum WheelMsg {
    Arm(Arm),
    Stop,
}

struct Arm {
    deadline: Instant,
    seq: u64,
    work: Weak<WorkInner>,
}

impl PartialEq for Arm {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Arm {}

impl PartialOrd for Arm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Arm {
    // Reversed: BinaryHeap is a max-heap, the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle to the timer thread. Cloning shares the same thread.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<WheelInner>,
}

struct WheelInner {
    tx: Sender<WheelMsg>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || wheel_loop(rx))
            .with_context(|| format!("Failed to spawn timer thread {}", name))?;

        Ok(Self {
            inner: Arc::new(WheelInner {
                tx,
                thread_id: handle.thread().id(),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Create a delayed work item running `func` on this wheel's thread.
    pub fn delayed<F>(&self, name: String, func: F) -> DelayedWork
    where
        F: Fn() + Send + Sync + 'static,
    {
        DelayedWork {
            inner: Arc::new(WorkInner {
                name,
                state: Mutex::new(WorkState::default()),
                done: Condvar::new(),
                func: Box::new(func),
            }),
            tx: self.inner.tx.clone(),
        }
    }

    /// Stop the timer thread. Armed work is dropped without firing. Joins
    /// the thread unless called from a timer callback.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(WheelMsg::Stop);
        if thread::current().id() == self.inner.thread_id {
            return;
        }
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

fn wheel_loop(rx: Receiver<WheelMsg>) {
    let mut heap: BinaryHeap<Arm> = BinaryHeap::new();

    loop {
        let msg = match heap.peek() {
            Some(next) => rx.recv_timeout(next.deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match msg {
            Ok(WheelMsg::Arm(arm)) => heap.push(arm),
            Ok(WheelMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|arm| arm.deadline <= now) {
            if let Some(arm) = heap.pop() {
                if let Some(work) = arm.work.upgrade() {
                    work.fire(arm.seq);
                }
            }
        }
    }

    debug!("timer thread stopped ({} armed entries dropped)", heap.len());
}

#[derive(Default)]
struct WorkState {
    seq: u64,
    armed: Option<u64>,
    running: bool,
}

struct WorkInner {
    name: String,
    state: Mutex<WorkState>,
    done: Condvar,
    func: Box<dyn Fn() + Send + Sync>,
}

impl WorkInner {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, seq: u64) {
        {
            let mut state = self.lock();
            // Cancelled or re-armed since this entry was queued.
            if state.armed != Some(seq) {
                return;
            }
            state.armed = None;
            state.running = true;
        }

        trace!("{}: firing", self.name);
        (self.func)();

        let mut state = self.lock();
        state.running = false;
        self.done.notify_all();
    }
}

/// A deferred callback that can be armed, re-armed and synchronously
/// cancelled.
pub struct DelayedWork {
    inner: Arc<WorkInner>,
    tx: Sender<WheelMsg>,
}

impl DelayedWork {
    /// Arm the work to fire after `delay`, replacing any earlier deadline.
    pub fn schedule(&self, delay: Duration) -> Result<()> {
        let mut state = self.inner.lock();
        state.seq += 1;
        let seq = state.seq;
        let arm = Arm {
            deadline: Instant::now() + delay,
            seq,
            work: Arc::downgrade(&self.inner),
        };

        if self.tx.send(WheelMsg::Arm(arm)).is_err() {
            state.armed = None;
            anyhow::bail!("{}: timer thread is gone", self.inner.name);
        }
        state.armed = Some(seq);
        Ok(())
    }

    /// Disarm the work and wait for an in-flight firing to finish. Must not
    /// be called from the work's own callback.
    pub fn cancel_sync(&self) -> bool {
        let mut state = self.inner.lock();
        let was_armed = state.armed.take().is_some();
        while state.running {
            state = self
                .inner
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        was_armed
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().armed.is_some()
    }
}
