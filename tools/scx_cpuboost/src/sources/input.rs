// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Touchscreen and touchpad activity from evdev.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use anyhow::Result;
use evdev::AbsoluteAxisType;
use evdev::EventType;
use evdev::Key;
use log::{debug, info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use super::{set_nonblocking, SourceHandle};
use crate::engine::CpuBoost;
use crate::input::{DeviceCaps, InputProfile};

const RESCAN_INTERVAL: Duration = Duration::from_secs(5);
const MAX_EVENTS_PER_FD: usize = 512;

struct TrackedDevice {
    path: PathBuf,
    dev: evdev::Device,
    profile: InputProfile,
}

fn udev_flag(device: &udev::Device, key: &str) -> bool {
    device
        .property_value(key)
        .map(|v| v == OsStr::new("1"))
        .unwrap_or(false)
}

/// Classification from udev's input_id builtin, if udev knows the node.
fn detect_via_udev_properties(dev_path: &Path) -> Option<InputProfile> {
    let name = dev_path.file_name()?;
    let syspath = Path::new("/sys/class/input").join(name);
    let device = udev::Device::from_syspath(&syspath).ok()?;
    InputProfile::from_udev(
        udev_flag(&device, "ID_INPUT_TOUCHSCREEN"),
        udev_flag(&device, "ID_INPUT_TOUCHPAD"),
    )
}

fn device_caps(dev: &evdev::Device) -> DeviceCaps {
    let supported = dev.supported_events();
    let abs = dev.supported_absolute_axes();
    let has_abs = |axis: AbsoluteAxisType| supported.contains(EventType::ABSOLUTE) && abs.is_some_and(|a| a.contains(axis));

    DeviceCaps {
        abs_mt_position_x: has_abs(AbsoluteAxisType::ABS_MT_POSITION_X),
        abs_mt_position_y: has_abs(AbsoluteAxisType::ABS_MT_POSITION_Y),
        abs_x: has_abs(AbsoluteAxisType::ABS_X),
        abs_y: has_abs(AbsoluteAxisType::ABS_Y),
        btn_touch: dev.supported_keys().is_some_and(|k| k.contains(Key::BTN_TOUCH)),
    }
}

pub fn classify_device(dev: &evdev::Device, dev_path: &Path) -> Option<InputProfile> {
    detect_via_udev_properties(dev_path).or_else(|| InputProfile::from_caps(&device_caps(dev)))
}

fn is_event_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|name| name.starts_with("event"))
}

fn scan_devices(dev_dir: &Path, known: &HashMap<i32, TrackedDevice>) -> Vec<TrackedDevice> {
    let Ok(dir) = std::fs::read_dir(dev_dir) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for entry in dir.flatten() {
        let path = entry.path();
        if !is_event_node(&path) || known.values().any(|t| t.path == path) {
            continue;
        }
        let Ok(dev) = evdev::Device::open(&path) else {
            continue;
        };
        let Some(profile) = classify_device(&dev, &path) else {
            continue;
        };
        if let Err(e) = set_nonblocking(dev.as_raw_fd()) {
            warn!("input: {}: cannot set O_NONBLOCK: {}", path.display(), e);
            continue;
        }

        let input_id = dev.input_id();
        info!(
            "input: registered {:?} device: {} (vendor={:#06x} product={:#06x})",
            profile,
            dev.name().unwrap_or("unknown"),
            input_id.vendor(),
            input_id.product()
        );
        found.push(TrackedDevice { path, dev, profile });
    }
    found
}

fn register(epfd: &Epoll, devices: &mut HashMap<i32, TrackedDevice>, new: Vec<TrackedDevice>) {
    for t in new {
        let fd = t.dev.as_raw_fd();
        // SAFETY: the fd belongs to `t.dev`, which stays in `devices` until
        // it is removed from the epoll set.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = epfd.add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64)) {
            warn!("input: {}: epoll add failed: {}", t.path.display(), e);
            continue;
        }
        devices.insert(fd, t);
    }
}

fn unregister(epfd: &Epoll, devices: &mut HashMap<i32, TrackedDevice>, fd: i32) {
    if let Some(t) = devices.remove(&fd) {
        // SAFETY: `t.dev` still owns the fd until it is dropped below.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = epfd.delete(bfd);
        info!("input: {:?} device {} removed", t.profile, t.path.display());
    }
}

pub fn spawn(engine: Arc<CpuBoost>, dev_dir: PathBuf) -> Result<SourceHandle> {
    let epfd = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| anyhow!(e))?;
    let mut devices = HashMap::new();
    let initial = scan_devices(&dev_dir, &devices);
    if initial.is_empty() {
        warn!("input: no touchscreen or touchpad under {}", dev_dir.display());
    }
    register(&epfd, &mut devices, initial);

    SourceHandle::spawn("cpuboost-evdev", move |shutdown| {
        const EPOLL_TIMEOUT_MS: u16 = 100;
        let mut events = [EpollEvent::empty(); 16];
        let mut last_scan = Instant::now();

        while !shutdown.load(Ordering::Relaxed) {
            if last_scan.elapsed() >= RESCAN_INTERVAL {
                last_scan = Instant::now();
                let new = scan_devices(&dev_dir, &devices);
                register(&epfd, &mut devices, new);
            }

            let n = match epfd.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("input: epoll_wait failed: {}", e);
                    break;
                }
            };

            for ev in &events[..n] {
                let fd = ev.data() as i32;
                let flags = ev.events();
                if flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLERR) {
                    unregister(&epfd, &mut devices, fd);
                    continue;
                }

                let Some(t) = devices.get_mut(&fd) else {
                    continue;
                };
                // Batch: one trigger per wakeup, SYN reports alone don't count.
                let activity = match t.dev.fetch_events() {
                    Ok(iter) => Ok(iter
                        .take(MAX_EVENTS_PER_FD)
                        .fold(false, |acc, e| acc || e.event_type() != EventType::SYNCHRONIZATION)),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
                    Err(e) => Err(e),
                };

                match activity {
                    Ok(true) => {
                        engine.on_input_event();
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!("input: fd {}: {}", fd, e);
                        unregister(&epfd, &mut devices, fd);
                    }
                }
            }
        }
        info!("input: stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_event_nodes_are_scanned() {
        assert!(is_event_node(Path::new("/dev/input/event3")));
        assert!(!is_event_node(Path::new("/dev/input/mouse0")));
        assert!(!is_event_node(Path::new("/dev/input/by-id")));
    }

    #[test]
    fn empty_directory_yields_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("event0"), b"").unwrap();
        assert!(scan_devices(dir.path(), &HashMap::new()).is_empty());
        assert!(scan_devices(&dir.path().join("missing"), &HashMap::new()).is_empty());
    }
}
