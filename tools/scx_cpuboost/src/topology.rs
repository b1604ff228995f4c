// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Core ids and kernel cpulists.
//!
//! `parse_cpu_list` is adapted from `scx_utils`' `cpu_list.rs` (GPL-2.0) and
//! yields [`CoreId`]s instead of raw indices.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Upper bound on logical CPU ids accepted from cpulists.
pub const MAX_CPUS: usize = 4096;

/// Logical core id. Only meaningful once resolved against the engine's
/// per-core arena, which rejects ids past the possible-core count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreId(u32);

impl CoreId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for CoreId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

/// Parse a kernel cpulist ("0-3,6,8-9") into core ids, dropping duplicates
/// while keeping first-seen order.
pub fn parse_cpu_list(optarg: &str) -> Result<Vec<CoreId>, String> {
    let mut cpus = Vec::new();
    let mut seen = HashSet::new();

    if optarg
        .chars()
        .any(|c| !c.is_ascii_digit() && c != '-' && c != ',' && !c.is_whitespace())
    {
        return Err("Invalid character in CPU list".to_string());
    }

    for token in optarg.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let (start, end) = match token.split_once('-') {
            Some((start_str, end_str)) => {
                let start = start_str.trim().parse::<u32>().map_err(|_| "Invalid range start")?;
                let end = end_str.trim().parse::<u32>().map_err(|_| "Invalid range end")?;
                if start > end {
                    return Err(format!("Invalid CPU range: {}-{}", start, end));
                }
                (start, end)
            }
            None => {
                let cpu = token.parse::<u32>().map_err(|_| format!("Invalid CPU: {}", token))?;
                (cpu, cpu)
            }
        };

        for i in start..=end {
            if i as usize >= MAX_CPUS {
                return Err(format!("CPU {} out of range (max {})", i, MAX_CPUS - 1));
            }
            if seen.insert(i) {
                cpus.push(CoreId::new(i));
            }
        }
    }

    Ok(cpus)
}

/// Read and parse a sysfs cpulist file such as
/// `/sys/devices/system/cpu/possible`.
pub fn read_cpu_list(path: &Path) -> Result<Vec<CoreId>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_cpu_list(content.trim())
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

/// Number of possible cores, i.e. the highest id in the possible list + 1.
pub fn nr_possible(cpus: &[CoreId]) -> usize {
    cpus.iter().map(|c| c.index() + 1).max().unwrap_or(0)
}
