// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Display wake detection from DRM connector and backlight power state.
//!
//! A display counts as on when any DRM connector reports `dpms` "On" or any
//! backlight reports `bl_power` 0 (unblanked). The engine is told once per
//! off-to-on transition.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use log::{debug, info};

use super::SourceHandle;
use crate::engine::CpuBoost;

pub const DRM_CLASS: &str = "/sys/class/drm";
pub const BACKLIGHT_CLASS: &str = "/sys/class/backlight";

const DISPLAY_POLL: Duration = Duration::from_millis(250);

/// `(readable, any_on)` over `<class>/*/<attr>`.
fn scan_class(class: &Path, attr: &str, is_on: impl Fn(&str) -> bool) -> (bool, bool) {
    let Ok(dir) = fs::read_dir(class) else {
        return (false, false);
    };

    let mut readable = false;
    for entry in dir.flatten() {
        let Ok(val) = fs::read_to_string(entry.path().join(attr)) else {
            continue;
        };
        readable = true;
        if is_on(val.trim()) {
            return (true, true);
        }
    }
    (readable, false)
}

/// Current display power state, `None` when neither class exposes one.
pub fn display_on(drm: &Path, backlight: &Path) -> Option<bool> {
    let (drm_seen, drm_on) = scan_class(drm, "dpms", |v| v == "On");
    if drm_on {
        return Some(true);
    }
    let (bl_seen, bl_on) = scan_class(backlight, "bl_power", |v| v == "0");
    if drm_seen || bl_seen {
        Some(bl_on)
    } else {
        None
    }
}

pub fn woke(prev: bool, cur: bool) -> bool {
    !prev && cur
}

pub fn spawn(engine: Arc<CpuBoost>, drm: PathBuf, backlight: PathBuf) -> Result<SourceHandle> {
    let Some(mut on) = display_on(&drm, &backlight) else {
        bail!(
            "no display power state under {} or {}",
            drm.display(),
            backlight.display()
        );
    };
    info!("display: watching power state (currently {})", if on { "on" } else { "off" });

    SourceHandle::spawn("cpuboost-display", move |shutdown| {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(DISPLAY_POLL);

            // A display that vanished keeps the last known state.
            let Some(cur) = display_on(&drm, &backlight) else {
                continue;
            };
            if woke(on, cur) {
                debug!("display: woke up");
                engine.on_display_wake();
            }
            on = cur;
        }
        info!("display: stopped");
    })
}
