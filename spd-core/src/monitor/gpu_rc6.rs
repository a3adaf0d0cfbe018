//! GPU idle-residency monitor
//!
//! Reads a monotonic idle-residency counter (milliseconds) once per poll
//! window. The delta between successive reads divided by the window length
//! gives the idle fraction; at or below the high-load threshold the GPU is
//! classified as busy (`gfx_mode = 1`).
//!
//! The monitor starts paused. Only the coordinator resumes it, and only while
//! the workload classification indicates an active workload, so the GPU is
//! not sampled during idle phases.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use spd_error::{DaemonError, Result};
use tracing::{debug, error, info};

use crate::constants::{gpu, names, paths};
use crate::monitor::{relock, AlertSlot, ChangeCallback, Monitor, PauseGate};
use crate::sysfs;

/// Idle percentage over one poll window, clamped to [0, 100]
pub(crate) fn idle_percent(delta_ms: u64, window: Duration) -> f64 {
    let window_ms = window.as_millis().max(1) as f64;
    (delta_ms as f64 * 100.0 / window_ms).clamp(0.0, 100.0)
}

/// 1 when the idle share is low enough to mean high GPU load, else 0
pub(crate) fn gfx_mode(idle: f64) -> i32 {
    if idle <= gpu::HIGH_LOAD_IDLE_PERCENT {
        1
    } else {
        0
    }
}

/// Pausable poller over the GPU idle-residency counter
pub struct GpuRc6Monitor {
    gate: PauseGate,
    alert: AlertSlot,
    residency_path: PathBuf,
    poll_interval: Duration,
    last_raw: Mutex<Option<u64>>,
}

impl GpuRc6Monitor {
    pub fn new() -> Self {
        Self::with_source(paths::GPU_IDLE_RESIDENCY, gpu::POLL_INTERVAL)
    }

    /// Poller over an alternate counter file, for tests and odd deployments
    pub fn with_source(residency_path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            gate: PauseGate::new(true),
            alert: AlertSlot::new(),
            residency_path: residency_path.into(),
            poll_interval,
            last_raw: Mutex::new(None),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    fn read_residency(&self) -> Result<u64> {
        let value = sysfs::read_trimmed(&self.residency_path)?;
        value
            .parse::<u64>()
            .map_err(|_| DaemonError::value_parse(&self.residency_path, value))
    }

    /// Fold one counter reading into the observed state; returns the
    /// `(idle_percent, gfx_mode)` pair when the raw value moved.
    fn observe(&self, raw: u64) -> Option<(i32, i32)> {
        let mut last = relock(self.last_raw.lock());
        let previous = match *last {
            Some(prev) if prev != raw => prev,
            Some(_) => return None,
            None => {
                // First reading establishes the baseline only
                *last = Some(raw);
                return None;
            }
        };
        // Counter reset leaves a zero delta (fully busy window)
        let delta = raw.saturating_sub(previous);
        *last = Some(raw);
        drop(last);

        let idle = idle_percent(delta, self.poll_interval);
        Some((idle as i32, gfx_mode(idle)))
    }
}

impl Default for GpuRc6Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor for GpuRc6Monitor {
    fn name(&self) -> &'static str {
        names::GPU_RC6
    }

    fn init(&self) -> Result<()> {
        // The counter must be readable; otherwise the monitor is excluded
        self.read_residency().map_err(|e| DaemonError::MonitorInit {
            name: self.name().into(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn run(&self) {
        info!("{}: worker started for {}", self.name(), self.residency_path.display());

        // No baseline yet; the first read after a resume establishes it and
        // the second produces the first measured window.
        let mut consecutive_read_errors: u32 = 0;
        loop {
            if !self.gate.wait_ready() {
                break;
            }
            if !self.gate.sleep(self.poll_interval) {
                break;
            }
            if self.gate.is_paused() {
                continue;
            }

            match self.read_residency() {
                Ok(raw) => {
                    if consecutive_read_errors > 0 {
                        debug!(
                            "{}: read recovered after {} errors",
                            self.name(),
                            consecutive_read_errors
                        );
                        consecutive_read_errors = 0;
                    }
                    if let Some((idle, mode)) = self.observe(raw) {
                        if mode == 1 {
                            info!(
                                "{}: high GPU load detected, {}% idle",
                                self.name(),
                                idle
                            );
                        }
                        self.alert.fire(self.name(), idle, mode);
                    }
                }
                Err(e) => {
                    consecutive_read_errors += 1;
                    if consecutive_read_errors == 1
                        || consecutive_read_errors % gpu::MAX_CONSECUTIVE_READ_ERRORS == 0
                    {
                        error!(
                            "{}: read failed (count: {}): {}",
                            self.name(),
                            consecutive_read_errors,
                            e
                        );
                    }
                }
            }
        }
        info!("{}: worker exiting", self.name());
    }

    fn pause(&self) {
        info!("{}: polling paused", self.name());
        self.gate.pause();
        // The counter keeps advancing while paused; drop the baseline so the
        // first resumed window is not measured against it
        *relock(self.last_raw.lock()) = None;
    }

    fn resume(&self) {
        info!("{}: polling resumed", self.name());
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn idle_percent_is_clamped() {
        let window = Duration::from_millis(1000);
        assert_eq!(idle_percent(0, window), 0.0);
        assert_eq!(idle_percent(400, window), 40.0);
        assert_eq!(idle_percent(2500, window), 100.0);
    }

    #[test]
    fn classification_threshold_is_inclusive() {
        assert_eq!(gfx_mode(0.0), 1);
        assert_eq!(gfx_mode(40.0), 1);
        assert_eq!(gfx_mode(40.1), 0);
        assert_eq!(gfx_mode(100.0), 0);
    }

    #[test]
    fn observe_measures_delta_against_previous_reading() {
        let monitor =
            GpuRc6Monitor::with_source("/nonexistent", Duration::from_millis(1000));

        // Baseline: no event
        assert_eq!(monitor.observe(10_000), None);
        // 300ms idle over a 1000ms window: 30% idle, high load
        assert_eq!(monitor.observe(10_300), Some((30, 1)));
        // 900ms idle: 90% idle, normal load
        assert_eq!(monitor.observe(11_200), Some((90, 0)));
        // Unchanged counter: no event
        assert_eq!(monitor.observe(11_200), None);
    }

    #[test]
    fn counter_reset_reads_as_fully_busy() {
        let monitor =
            GpuRc6Monitor::with_source("/nonexistent", Duration::from_millis(1000));
        assert_eq!(monitor.observe(50_000), None);
        assert_eq!(monitor.observe(100), Some((0, 1)));
    }

    #[test]
    fn starts_paused_and_resume_unblocks_quickly() {
        let monitor = Arc::new(GpuRc6Monitor::with_source(
            "/nonexistent",
            Duration::from_millis(1000),
        ));
        assert!(monitor.is_paused());

        let worker = Arc::clone(&monitor);
        let handle = std::thread::spawn(move || worker.run());

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        monitor.stop();
        handle.join().unwrap();
        assert!(started.elapsed() < gpu::WAKE_SLICE);
    }
}
