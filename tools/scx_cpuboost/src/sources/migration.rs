// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task migrations from the `sched:sched_migrate_task` tracepoint.
//!
//! The tracepoint carries no utilization, so events are reported with load 0
//! and only drive frequency-mirroring mode.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::{debug, info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use super::SourceHandle;
use crate::engine::CpuBoost;
use crate::migration::MigrationEvent;
use crate::topology::CoreId;

const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];
const EVENT_ENABLE: &str = "events/sched/sched_migrate_task/enable";

/// Parse one `trace_pipe` line, e.g.
/// `foo-123 [001] d..2. 42.0: sched_migrate_task: comm=foo pid=123 prio=120 orig_cpu=1 dest_cpu=3`.
pub fn parse_migrate_line(line: &str) -> Option<MigrationEvent> {
    let (_, fields) = line.split_once("sched_migrate_task:")?;
    let mut orig = None;
    let mut dest = None;

    // comm may contain spaces, so scan from the end.
    for tok in fields.split_whitespace().rev() {
        if let Some(v) = tok.strip_prefix("dest_cpu=") {
            dest = dest.or(v.parse::<u32>().ok());
        } else if let Some(v) = tok.strip_prefix("orig_cpu=") {
            orig = orig.or(v.parse::<u32>().ok());
        }
        if orig.is_some() && dest.is_some() {
            break;
        }
    }

    Some(MigrationEvent {
        src_core: CoreId::new(orig?),
        dest_core: CoreId::new(dest?),
        load: 0,
    })
}

/// Accumulates raw pipe reads and yields complete lines.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn feed(&mut self, chunk: &[u8], mut f: impl FnMut(&str)) {
        self.pending.extend_from_slice(chunk);
        let Some(last_nl) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let rest = self.pending.split_off(last_nl + 1);
        for line in String::from_utf8_lossy(&self.pending).lines() {
            f(line);
        }
        self.pending = rest;
    }
}

pub fn find_tracefs() -> Option<PathBuf> {
    TRACEFS_ROOTS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.join("trace_pipe").exists())
}

fn set_event(tracefs: &Path, on: bool) -> Result<()> {
    let path = tracefs.join(EVENT_ENABLE);
    fs::write(&path, if on { "1" } else { "0" })
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn open_pipe(tracefs: &Path) -> Result<File> {
    let path = tracefs.join("trace_pipe");
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

pub fn spawn(engine: Arc<CpuBoost>, tracefs: Option<PathBuf>) -> Result<SourceHandle> {
    let Some(tracefs) = tracefs.or_else(find_tracefs) else {
        bail!("tracefs not mounted");
    };
    if engine.config().load_based_syncs {
        warn!("migration trace carries no task load; load-based syncs will skip every event");
    }

    set_event(&tracefs, true)?;
    let mut pipe = open_pipe(&tracefs)?;
    let epfd = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| anyhow!(e))?;
    epfd.add(&pipe, EpollEvent::new(EpollFlags::EPOLLIN, 0))
        .map_err(|e| anyhow!("Failed to register trace_pipe with epoll: {}", e))?;
    info!("migrations: reading {}", tracefs.join("trace_pipe").display());

    SourceHandle::spawn("cpuboost-migrate", move |shutdown| {
        const EPOLL_TIMEOUT_MS: u16 = 100;
        let mut events = [EpollEvent::empty(); 4];
        let mut buf = vec![0u8; 64 * 1024];
        let mut lines = LineBuffer::default();

        'outer: while !shutdown.load(Ordering::Relaxed) {
            match epfd.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("migrations: epoll_wait failed: {}", e);
                    break;
                }
            }

            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => lines.feed(&buf[..n], |line| {
                        if let Some(ev) = parse_migrate_line(line) {
                            if let Err(e) = engine.on_migration(ev) {
                                debug!("migrations: {:#}", e);
                            }
                        }
                    }),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("migrations: read failed: {}", e);
                        break 'outer;
                    }
                }
            }
        }

        if let Err(e) = set_event(&tracefs, false) {
            warn!("migrations: {:#}", e);
        }
        info!("migrations: stopped");
    })
}
