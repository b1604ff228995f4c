// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use chrono::Local;
use log::{info, warn};
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

/// Event counters bumped from the hot paths. Relaxed: they are only ever
/// read as a monitoring snapshot.
#[derive(Debug, Default)]
pub struct BoostStats {
    pub migrations: AtomicU64,
    pub mig_queued: AtomicU64,
    pub mig_skipped: AtomicU64,
    pub mig_invalid: AtomicU64,
    pub sync_boosts: AtomicU64,
    pub sync_none: AtomicU64,
    pub sync_offline: AtomicU64,
    pub policy_errors: AtomicU64,
    pub boost_removals: AtomicU64,
    pub input_events: AtomicU64,
    pub input_debounced: AtomicU64,
    pub input_queued: AtomicU64,
    pub input_boosts: AtomicU64,
    pub hotplug_boosts: AtomicU64,
    pub wake_boosts: AtomicU64,
}

impl BoostStats {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Stats)]
#[serde(default)]
pub struct CoreFloors {
    #[stat(desc = "CPU id")]
    pub cpu: u64,
    #[stat(desc = "Migration boost floor (kHz, 0=none)")]
    pub boost_min: u64,
    #[stat(desc = "Input/hotplug/wake boost floor (kHz, 0=none)")]
    pub input_boost_min: u64,
}

impl CoreFloors {
    pub fn key(cpu: usize) -> String {
        format!("cpu{}", cpu)
    }

    fn boosted(&self) -> bool {
        self.boost_min != 0 || self.input_boost_min != 0
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Migrations seen in interval")]
    pub migrations: u64,
    #[stat(desc = "Migrations handed to a worker in interval")]
    pub mig_queued: u64,
    #[stat(desc = "Migrations filtered out in interval")]
    pub mig_skipped: u64,
    #[stat(desc = "Migrations rejected as invalid in interval")]
    pub mig_invalid: u64,
    #[stat(desc = "Migration boosts applied in interval")]
    pub sync_boosts: u64,
    #[stat(desc = "Migration syncs at or below hardware min in interval")]
    pub sync_none: u64,
    #[stat(desc = "Migration syncs to an offline core in interval")]
    pub sync_offline: u64,
    #[stat(desc = "Policy query failures in interval")]
    pub policy_errors: u64,
    #[stat(desc = "Boost floors removed by decay in interval")]
    pub boost_removals: u64,
    #[stat(desc = "Input events seen in interval")]
    pub input_events: u64,
    #[stat(desc = "Input events dropped by debounce in interval")]
    pub input_debounced: u64,
    #[stat(desc = "Input boost jobs queued in interval")]
    pub input_queued: u64,
    #[stat(desc = "Input boost job runs that raised a floor in interval")]
    pub input_boosts: u64,
    #[stat(desc = "Hotplug boosts queued in interval")]
    pub hotplug_boosts: u64,
    #[stat(desc = "Display wake boosts queued in interval")]
    pub wake_boosts: u64,
    #[stat(desc = "Live per-core floors")]
    pub floors: BTreeMap<String, CoreFloors>,
}

impl Metrics {
    pub fn snapshot(stats: &BoostStats, floors: Vec<CoreFloors>) -> Self {
        Self {
            migrations: BoostStats::get(&stats.migrations),
            mig_queued: BoostStats::get(&stats.mig_queued),
            mig_skipped: BoostStats::get(&stats.mig_skipped),
            mig_invalid: BoostStats::get(&stats.mig_invalid),
            sync_boosts: BoostStats::get(&stats.sync_boosts),
            sync_none: BoostStats::get(&stats.sync_none),
            sync_offline: BoostStats::get(&stats.sync_offline),
            policy_errors: BoostStats::get(&stats.policy_errors),
            boost_removals: BoostStats::get(&stats.boost_removals),
            input_events: BoostStats::get(&stats.input_events),
            input_debounced: BoostStats::get(&stats.input_debounced),
            input_queued: BoostStats::get(&stats.input_queued),
            input_boosts: BoostStats::get(&stats.input_boosts),
            hotplug_boosts: BoostStats::get(&stats.hotplug_boosts),
            wake_boosts: BoostStats::get(&stats.wake_boosts),
            floors: floors
                .into_iter()
                .map(|f| (CoreFloors::key(f.cpu as usize), f))
                .collect(),
        }
    }

    pub fn boosted_cores(&self) -> usize {
        self.floors.values().filter(|f| f.boosted()).count()
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ mig {:>6}  queued {:>6}  skip {:>6}  inval {:>4}",
            self.migrations, self.mig_queued, self.mig_skipped, self.mig_invalid
        )?;
        writeln!(
            w,
            "│ sync {:>6}  none {:>6}  offline {:>4}  rem {:>6}  perr {:>4}",
            self.sync_boosts, self.sync_none, self.sync_offline, self.boost_removals, self.policy_errors
        )?;
        writeln!(
            w,
            "│ input {:>6}  deb {:>6}  queued {:>5}  boosts {:>5}  hp {:>4}  wake {:>4}",
            self.input_events,
            self.input_debounced,
            self.input_queued,
            self.input_boosts,
            self.hotplug_boosts,
            self.wake_boosts
        )?;

        let mut boosted: Vec<_> = self.floors.values().filter(|f| f.boosted()).collect();
        boosted.sort_by_key(|f| f.cpu);
        for f in boosted {
            writeln!(
                w,
                "│ CPU{:<3} sync {:>8} kHz  input {:>8} kHz",
                f.cpu, f.boost_min, f.input_boost_min
            )?;
        }
        writeln!(w, "└─")?;
        Ok(())
    }

    fn delta(&self, prev: &Self) -> Self {
        Self {
            migrations: self.migrations.saturating_sub(prev.migrations),
            mig_queued: self.mig_queued.saturating_sub(prev.mig_queued),
            mig_skipped: self.mig_skipped.saturating_sub(prev.mig_skipped),
            mig_invalid: self.mig_invalid.saturating_sub(prev.mig_invalid),
            sync_boosts: self.sync_boosts.saturating_sub(prev.sync_boosts),
            sync_none: self.sync_none.saturating_sub(prev.sync_none),
            sync_offline: self.sync_offline.saturating_sub(prev.sync_offline),
            policy_errors: self.policy_errors.saturating_sub(prev.policy_errors),
            boost_removals: self.boost_removals.saturating_sub(prev.boost_removals),
            input_events: self.input_events.saturating_sub(prev.input_events),
            input_debounced: self.input_debounced.saturating_sub(prev.input_debounced),
            input_queued: self.input_queued.saturating_sub(prev.input_queued),
            input_boosts: self.input_boosts.saturating_sub(prev.input_boosts),
            hotplug_boosts: self.hotplug_boosts.saturating_sub(prev.hotplug_boosts),
            wake_boosts: self.wake_boosts.saturating_sub(prev.wake_boosts),
            floors: self.floors.clone(),
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(CoreFloors::meta())
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// clap parser for `--stats`/`--monitor` intervals in (fractional) seconds.
pub fn parse_interval(s: &str) -> Result<Duration> {
    let secs: f64 = s.trim().parse()?;
    if !secs.is_finite() || secs <= 0.0 {
        bail!("interval must be a positive number of seconds, got {}", s);
    }
    Ok(Duration::try_from_secs_f64(secs)?)
}

/// Poll the stats server every `intv` and hand each interval's metrics to
/// `output`, reconnecting while the server is unavailable.
fn monitor_stats(
    intv: Duration,
    shutdown: &AtomicBool,
    mut output: impl FnMut(Metrics) -> Result<()>,
) -> Result<()> {
    let mut retry_cnt: u32 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().connect() {
            Ok(client) => client,
            Err(e) => {
                if retry_cnt == 1 {
                    info!("Stats server not available ({}), retrying...", e);
                }
                retry_cnt += 1;
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        retry_cnt = 0;

        while !shutdown.load(Ordering::Relaxed) {
            let metrics = match client.request::<Metrics>("stats", vec![]) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Connection to stats server failed ({})", e);
                    thread::sleep(Duration::from_secs(1));
                    break;
                }
            };
            output(metrics)?;
            thread::sleep(intv);
        }
    }
    Ok(())
}

pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>, json: bool) -> Result<()> {
    monitor_stats(intv, &shutdown, |metrics| {
        let mut out = std::io::stdout().lock();
        if json {
            writeln!(out, "{}", serde_json::to_string(&metrics)?)?;
            Ok(())
        } else {
            metrics.format(&mut out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floors(cpu: u64, boost_min: u64, input_boost_min: u64) -> CoreFloors {
        CoreFloors { cpu, boost_min, input_boost_min }
    }

    #[test]
    fn format_lists_boosted_cores_only() {
        let stats = BoostStats::default();
        for _ in 0..12 {
            BoostStats::inc(&stats.migrations);
        }
        let m = Metrics::snapshot(&stats, vec![floors(0, 0, 0), floors(3, 900_000, 0)]);

        let mut out = Vec::new();
        m.format(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("mig     12"));
        assert!(s.contains("CPU3"));
        assert!(!s.contains("CPU0 "));
        assert_eq!(m.boosted_cores(), 1);
    }

    #[test]
    fn snapshot_keys_floors_by_cpu() {
        let m = Metrics::snapshot(&BoostStats::default(), vec![floors(2, 0, 1_000_000)]);
        assert_eq!(m.floors[&CoreFloors::key(2)].input_boost_min, 1_000_000);
    }

    #[test]
    fn delta_subtracts_counters_and_keeps_floors() {
        let stats = BoostStats::default();
        BoostStats::inc(&stats.migrations);
        let prev = Metrics::snapshot(&stats, vec![]);
        BoostStats::inc(&stats.migrations);
        BoostStats::inc(&stats.input_boosts);
        let cur = Metrics::snapshot(&stats, vec![floors(1, 0, 1_000_000)]);

        let d = cur.delta(&prev);
        assert_eq!(d.migrations, 1);
        assert_eq!(d.input_boosts, 1);
        assert_eq!(d.floors.len(), 1);
    }

    #[test]
    fn stats_json_deserializes_back() {
        let m = Metrics {
            wake_boosts: 2,
            ..Default::default()
        };
        let json = m.to_json().unwrap();
        let back: Metrics = serde_json::from_value(json).unwrap();
        assert_eq!(back.wake_boosts, 2);
    }

    #[test]
    fn interval_must_be_positive_and_finite() {
        assert_eq!(parse_interval("0.5").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("2").unwrap(), Duration::from_secs(2));
        for bad in ["-1", "0", "NaN", "inf", "1e300", "soon"] {
            assert!(parse_interval(bad).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn meta_describes_every_counter() {
        let mut out = Vec::new();
        server_data().describe_meta(&mut out, None).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("input_debounced"));
        assert!(s.contains("wake_boosts"));
        assert!(s.contains("boost_min"));
    }
}
