// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Event sources feeding the engine from the running system.
//!
//! Each source owns one thread that polls with a short timeout so it notices
//! the shutdown flag promptly.

pub mod config_watch;
pub mod display;
pub mod hotplug;
pub mod input;
pub mod migration;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use log::{info, warn};

/// Poll timeout shared by the sources.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct SourceHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_shutdown))
            .with_context(|| format!("failed to spawn {} thread", name))?;

        Ok(Self {
            name: name.to_string(),
            shutdown,
            thread: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        let Some(handle) = self.thread.take() else {
            return;
        };
        for _ in 0..20 {
            if handle.is_finished() {
                let _ = handle.join();
                info!("{}: clean shutdown", self.name);
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        warn!("{}: thread didn't exit within 2s, detaching", self.name);
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Put `fd` in non-blocking mode.
pub(crate) fn set_nonblocking(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on a caller-owned open fd; only flag bits are changed.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
