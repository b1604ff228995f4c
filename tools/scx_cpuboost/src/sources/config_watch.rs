// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Reload the TOML config when it changes on disk.

use std::ffi::OsString;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use inotify::{EventMask, Inotify, WatchMask};
use log::{info, warn};

use super::{set_nonblocking, SourceHandle, POLL_INTERVAL};
use crate::config::BoostConfig;
use crate::engine::CpuBoost;

/// Applied to every reloaded file, e.g. to keep command-line overrides.
pub type ConfigOverlay = Box<dyn Fn(BoostConfig) -> BoostConfig + Send>;

/// Reload `path`, apply `overlay` and hand the result to the engine. A file
/// that fails to parse or validate leaves the running config untouched.
pub fn reload(engine: &CpuBoost, path: &Path, overlay: &ConfigOverlay) -> Result<()> {
    let cfg = overlay(BoostConfig::from_file(path)?);
    engine.update_config(cfg)?;
    info!("config: reloaded {}", path.display());
    Ok(())
}

pub fn spawn(engine: Arc<CpuBoost>, path: PathBuf, overlay: ConfigOverlay) -> Result<SourceHandle> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name: OsString = path
        .file_name()
        .ok_or_else(|| anyhow!("{} is not a file path", path.display()))?
        .to_os_string();

    // Watch the directory: editors usually replace the file instead of
    // writing it in place.
    let mut inotify = Inotify::init().context("Failed to init inotify")?;
    set_nonblocking(inotify.as_raw_fd()).context("Failed to set inotify non-blocking")?;
    inotify
        .watches()
        .add(&dir, WatchMask::CLOSE_WRITE | WatchMask::MOVED_TO | WatchMask::CREATE)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    info!("config: watching {}", path.display());

    SourceHandle::spawn("cpuboost-config", move |shutdown| {
        let mut buffer = [0u8; 4096];
        while !shutdown.load(Ordering::Relaxed) {
            let mut changed = false;
            match inotify.read_events(&mut buffer) {
                Ok(events) => {
                    for event in events {
                        if event.mask.contains(EventMask::ISDIR) {
                            continue;
                        }
                        if event.name.is_some_and(|n| n == file_name.as_os_str()) {
                            changed = true;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("config: inotify error: {}, no more reloads", e);
                    break;
                }
            }

            if changed {
                if let Err(e) = reload(&engine, &path, &overlay) {
                    warn!("config: keeping previous config: {:#}", e);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
        info!("config: stopped");
    })
}
