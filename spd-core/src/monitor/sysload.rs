//! System CPU load estimation from /proc/stat
//!
//! Produces a smoothed system-wide %-busy figure over irregular sampling
//! intervals using an exponential moving average with
//! `alpha = 1 - exp(-dt / tau)`. The worker doubles as a busy-spike detector:
//! while running, it fires the change alert whenever the smoothed load
//! exceeds the high threshold.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use spd_error::{DaemonError, Result};
use tracing::{debug, info, warn};

use crate::constants::{load, names, paths};
use crate::monitor::{relock, AlertSlot, ChangeCallback, Monitor, PauseGate};
use crate::sysfs;

/// One reading of the aggregate `cpu` line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSample {
    pub total_ticks: u64,
    pub idle_ticks: u64,
}

/// Parse the aggregate `cpu  user nice system idle iowait ...` line.
///
/// `total` sums every numeric field; `idle` is idle + iowait.
pub(crate) fn parse_aggregate_line(line: &str) -> Result<LoadSample> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return Err(DaemonError::StatParse(line.to_string()));
    }

    let mut total = 0u64;
    let mut idle = 0u64;
    let mut index = 0usize;
    for field in fields {
        let value: u64 = field
            .parse()
            .map_err(|_| DaemonError::StatParse(line.to_string()))?;
        total = total.saturating_add(value);
        // fields 3 and 4 are idle and iowait
        if index == 3 || index == 4 {
            idle = idle.saturating_add(value);
        }
        index += 1;
    }
    if index == 0 {
        return Err(DaemonError::StatParse(line.to_string()));
    }
    Ok(LoadSample { total_ticks: total, idle_ticks: idle })
}

/// Irregular-interval EMA over raw %-busy readings.
///
/// Plain value type; the owning monitor guards it with its own mutex.
#[derive(Debug)]
pub struct LoadEstimator {
    value: Option<f64>,
    prev: Option<f64>,
    last_ts: Instant,
    last_sample: LoadSample,
}

impl LoadEstimator {
    pub fn new() -> Self {
        Self {
            value: None,
            prev: None,
            last_ts: Instant::now(),
            last_sample: LoadSample::default(),
        }
    }

    /// Fold one /proc/stat reading into the estimate and return the new EMA.
    ///
    /// Tick counters that went backwards (wrap or reset) clamp the delta to
    /// zero; a zero total delta yields an undefined raw reading which leaves
    /// the EMA untouched.
    pub fn ingest(&mut self, sample: LoadSample, now: Instant) -> f64 {
        let d_total = sample.total_ticks.saturating_sub(self.last_sample.total_ticks);
        let d_idle = sample.idle_ticks.saturating_sub(self.last_sample.idle_ticks);
        self.last_sample = sample;

        if d_total == 0 {
            return self.skip(now);
        }
        let busy = d_total.saturating_sub(d_idle);
        let raw = busy as f64 * 100.0 / d_total as f64;
        self.apply(raw, now)
    }

    /// Refresh the timestamp for an undefined raw reading.
    pub fn skip(&mut self, now: Instant) -> f64 {
        self.last_ts = now;
        self.value.unwrap_or(load::NO_SAMPLE)
    }

    fn apply(&mut self, raw: f64, now: Instant) -> f64 {
        let updated = match self.value {
            None => raw,
            Some(current) => {
                let dt = now
                    .saturating_duration_since(self.last_ts)
                    .as_secs_f64();
                let alpha = (1.0 - (-dt / load::EMA_TAU_SECS).exp()).clamp(0.0, 1.0);
                self.prev = Some(current);
                current * (1.0 - alpha) + raw * alpha
            }
        };
        debug!("CPU load EMA raw={:.2} value={:.2}", raw, updated);
        self.value = Some(updated);
        self.last_ts = now;
        updated
    }

    /// Current EMA, or the no-sample sentinel before the first defined reading
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(load::NO_SAMPLE)
    }

    /// EMA value preceding the most recent update
    pub fn previous(&self) -> f64 {
        self.prev.unwrap_or(load::NO_SAMPLE)
    }
}

impl Default for LoadEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic /proc/stat sampler and busy-spike detector.
///
/// Starts paused; the coordinator resumes it while core containment is
/// engaged so the spike detector only runs when its signal matters.
pub struct SysLoadMonitor {
    gate: PauseGate,
    alert: AlertSlot,
    estimator: Mutex<LoadEstimator>,
    stat_path: PathBuf,
    interval: Duration,
}

impl SysLoadMonitor {
    pub fn new() -> Self {
        Self::with_source(paths::PROC_STAT, load::SAMPLE_INTERVAL)
    }

    /// Sampler over an alternate stat file, for tests and odd deployments
    pub fn with_source(stat_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            gate: PauseGate::new(true),
            alert: AlertSlot::new(),
            estimator: Mutex::new(LoadEstimator::new()),
            stat_path: stat_path.into(),
            interval,
        }
    }

    /// Take one sample, update the EMA and return it.
    ///
    /// Read or parse failures are logged and treated as an undefined raw
    /// reading; the previous estimate survives.
    pub fn sample_and_get(&self) -> f64 {
        let now = Instant::now();
        let mut est = relock(self.estimator.lock());
        match self.read_sample() {
            Ok(sample) => est.ingest(sample, now),
            Err(e) => {
                warn!("{}: sample discarded: {}", names::SYS_LOAD, e);
                est.skip(now)
            }
        }
    }

    /// Current EMA without sampling
    pub fn latest(&self) -> f64 {
        relock(self.estimator.lock()).value()
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    fn read_sample(&self) -> Result<LoadSample> {
        let contents = sysfs::read_trimmed(&self.stat_path)?;
        let line = contents
            .lines()
            .next()
            .ok_or_else(|| DaemonError::StatParse(String::new()))?;
        parse_aggregate_line(line)
    }

    #[cfg(test)]
    pub(crate) fn force_ema(&self, value: f64) {
        let mut est = relock(self.estimator.lock());
        est.prev = est.value;
        est.value = Some(value);
    }
}

impl Default for SysLoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for SysLoadMonitor {
    fn name(&self) -> &'static str {
        names::SYS_LOAD
    }

    fn init(&self) -> Result<()> {
        // One probe read so an unreadable stat source excludes the monitor
        self.read_sample().map_err(|e| DaemonError::MonitorInit {
            name: self.name().into(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn run(&self) {
        info!("{}: worker started", self.name());
        loop {
            if !self.gate.wait_ready() {
                break;
            }

            let ema = self.sample_and_get();
            if ema > load::HIGH_THRESHOLD_PERCENT {
                info!(
                    "{}: high CPU load detected, above {:.1}%",
                    self.name(),
                    load::HIGH_THRESHOLD_PERCENT
                );
                let prev = relock(self.estimator.lock()).previous();
                self.alert.fire(self.name(), prev as i32, ema as i32);
            }

            if !self.gate.sleep(self.interval) {
                break;
            }
        }
        info!("{}: worker exiting", self.name());
    }

    fn pause(&self) {
        info!("{}: pausing periodic CPU load checks", self.name());
        self.gate.pause();
    }

    fn resume(&self) {
        info!("{}: resuming periodic CPU load checks", self.name());
        self.gate.resume();
    }

    fn stop(&self) {
        info!("{}: stop requested", self.name());
        self.gate.stop();
    }

    fn set_on_change(&self, cb: ChangeCallback) {
        self.alert.install(cb);
    }
}
