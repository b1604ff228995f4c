// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Core hotplug detection by diffing the sysfs `online` cpulist.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};

use super::SourceHandle;
use crate::engine::CpuBoost;
use crate::topology::{read_cpu_list, CoreId};

const HOTPLUG_POLL: Duration = Duration::from_millis(250);

/// Cores present in `cur` but not in `prev`, ascending.
pub fn newly_online(prev: &BTreeSet<CoreId>, cur: &BTreeSet<CoreId>) -> Vec<CoreId> {
    cur.difference(prev).copied().collect()
}

fn read_online(path: &PathBuf) -> Result<BTreeSet<CoreId>> {
    Ok(read_cpu_list(path)?.into_iter().collect())
}

pub fn spawn(engine: Arc<CpuBoost>, sysfs_root: PathBuf) -> Result<SourceHandle> {
    let path = sysfs_root.join("online");
    let mut online = read_online(&path)?;
    info!("hotplug: watching {} ({} cores online)", path.display(), online.len());

    SourceHandle::spawn("cpuboost-hotplug", move |shutdown| {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(HOTPLUG_POLL);

            let cur = match read_online(&path) {
                Ok(cur) => cur,
                Err(e) => {
                    warn!("hotplug: {:#}", e);
                    continue;
                }
            };
            for core in newly_online(&online, &cur) {
                debug!("hotplug: {} online", core);
                engine.on_core_online(core);
            }
            online = cur;
        }
        info!("hotplug: stopped");
    })
}
