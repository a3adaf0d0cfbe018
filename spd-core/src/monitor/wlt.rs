//! Workload-type (WLT) monitor
//!
//! Watches the platform's `workload_type_index` attribute. The low two bits
//! carry the classification; higher bits are reserved and forwarded intact
//! (bit 4 drives the stateless power bias mapping).
//!
//! Initialization enables the kernel feature if necessary and applies an
//! optional notification delay; either failure excludes this monitor without
//! taking the daemon down.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use spd_error::{DaemonError, Result};
use tracing::{debug, error, info, warn};

use crate::constants::{names, paths, timing};
use crate::monitor::{AlertSlot, ChangeCallback, Monitor, PauseGate};
use crate::sysfs;

/// Bit 4 of the raw index selects the power-biased profile in swlt mode
pub const SWLT_POWER_BIT: i32 = 1 << 4;

/// Workload classification carried in the low two bits of the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WltCode {
    Idle = 0,
    Btl = 1,
    Sustain = 2,
    Bursty = 3,
}

impl WltCode {
    pub fn from_raw(value: i32) -> Self {
        match value & 0x3 {
            0 => WltCode::Idle,
            1 => WltCode::Btl,
            2 => WltCode::Sustain,
            _ => WltCode::Bursty,
        }
    }

    /// Sustain and Bursty mean an active workload
    pub fn is_active(self) -> bool {
        matches!(self, WltCode::Sustain | WltCode::Bursty)
    }
}

/// POLLPRI-driven watcher of the workload-type index
pub struct WltMonitor {
    gate: PauseGate,
    alert: AlertSlot,
    index_path: PathBuf,
    enable_path: PathBuf,
    delay_path: PathBuf,
    notification_delay_ms: Option<u32>,
    poll_timeout: Duration,
}

impl WltMonitor {
    pub fn new(notification_delay_ms: Option<u32>) -> Self {
        Self {
            gate: PauseGate::new(false),
            alert: AlertSlot::new(),
            index_path: paths::WORKLOAD_TYPE_INDEX.into(),
            enable_path: paths::WORKLOAD_HINT_ENABLE.into(),
            delay_path: paths::WORKLOAD_NOTIFICATION_DELAY.into(),
            notification_delay_ms,
            poll_timeout: timing::POLL_BUDGET,
        }
    }

    /// Watcher over an alternate device directory, for tests
    pub fn with_device_dir(dir: impl Into<PathBuf>, notification_delay_ms: Option<u32>) -> Self {
        let dir = dir.into();
        Self {
            gate: PauseGate::new(false),
            alert: AlertSlot::new(),
            index_path: dir.join("workload_type_index"),
            enable_path: dir.join("workload_hint_enable"),
            delay_path: dir.join("notification_delay_ms"),
            notification_delay_ms,
            poll_timeout: timing::POLL_BUDGET,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }
}

impl Monitor for WltMonitor {
    fn name(&self) -> &'static str {
        names::WLT
    }

    fn init(&self) -> Result<()> {
        let enabled = sysfs::read_trimmed(&self.enable_path).map_err(|e| {
            DaemonError::MonitorInit { name: self.name().into(), reason: e.to_string() }
        })?;
        if enabled.starts_with('0') {
            sysfs::write_str(&self.enable_path, "1\n").map_err(|e| {
                DaemonError::MonitorInit { name: self.name().into(), reason: e.to_string() }
            })?;
            debug!("{}: enabled workload hints via {}", self.name(), self.enable_path.display());
        }

        if let Some(delay) = self.notification_delay_ms {
            sysfs::write_str(&self.delay_path, &format!("{}\n", delay)).map_err(|e| {
                DaemonError::MonitorInit { name: self.name().into(), reason: e.to_string() }
            })?;
            debug!("{}: set notification delay to {} ms", self.name(), delay);
        }
        Ok(())
    }

    fn run(&self) {
        info!("{}: worker started for {}", self.name(), self.index_path.display());
        let mut previous: Option<i32> = None;

        loop {
            if !self.gate.wait_ready() {
                break;
            }

            let file = match File::open(&self.index_path) {
                Ok(f) => f,
                Err(e) => {
                    error!("{}: open failed: {}", self.name(), e);
                    if !self.gate.sleep(timing::POLL_ERROR_BACKOFF) {
                        break;
                    }
                    continue;
                }
            };

            match sysfs::consume(&file, &self.index_path) {
                Ok(value) => match value.parse::<i32>() {
                    Ok(current) if previous != Some(current) => {
                        debug!(
                            "{}: index changed {:?} -> {}",
                            self.name(),
                            previous,
                            current
                        );
                        // The very first observation reports against zero
                        self.alert.fire(self.name(), previous.unwrap_or(0), current);
                        previous = Some(current);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        warn!("{}: discarding unparsable index '{}'", self.name(), value);
                    }
                },
                Err(e) => error!("{}: read failed: {}", self.name(), e),
            }

            match sysfs::wait_pri(&file, &self.index_path, self.poll_timeout) {
                // Updated or timed out either way: the next iteration re-reads
                Ok(_) => {}
                Err(e) => {
                    error!("{}: {}", self.name(), e);
                    if !self.gate.sleep(timing::POLL_ERROR_BACKOFF) {
                        break;
                    }
                }
            }
        }
        info!("{}: worker exiting", self.name());
    }

    fn pause(&self) {
        info!("{}: polling paused", self.name());
        self.gate.pause();
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
    use std::sync::{Arc, Mutex};

    fn temp_device_dir(enable: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "spd-wlt-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("workload_hint_enable"), enable).unwrap();
        std::fs::write(dir.join("workload_type_index"), "0\n").unwrap();
        dir
    }

    #[test]
    fn classification_uses_low_two_bits_only() {
        assert_eq!(WltCode::from_raw(0), WltCode::Idle);
        assert_eq!(WltCode::from_raw(1), WltCode::Btl);
        assert_eq!(WltCode::from_raw(2), WltCode::Sustain);
        assert_eq!(WltCode::from_raw(3), WltCode::Bursty);
        // Reserved high bits are ignored for classification
        assert_eq!(WltCode::from_raw(0x12), WltCode::Sustain);
        assert_eq!(WltCode::from_raw(SWLT_POWER_BIT), WltCode::Idle);
    }

    #[test]
    fn active_codes() {
        assert!(!WltCode::Idle.is_active());
        assert!(!WltCode::Btl.is_active());
        assert!(WltCode::Sustain.is_active());
        assert!(WltCode::Bursty.is_active());
    }

    #[test]
    fn init_enables_feature_when_disabled() {
        let dir = temp_device_dir("0\n");
        let monitor = WltMonitor::with_device_dir(&dir, None);
        monitor.init().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("workload_hint_enable")).unwrap(),
            "1\n"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn init_leaves_enabled_feature_alone() {
        let dir = temp_device_dir("1\n");
        let monitor = WltMonitor::with_device_dir(&dir, None);
        monitor.init().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("workload_hint_enable")).unwrap(),
            "1\n"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn init_writes_notification_delay() {
        let dir = temp_device_dir("1\n");
        let monitor = WltMonitor::with_device_dir(&dir, Some(250));
        monitor.init().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("notification_delay_ms")).unwrap(),
            "250\n"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn init_fails_without_device() {
        let monitor = WltMonitor::with_device_dir("/nonexistent/workload_hint", None);
        assert!(monitor.init().is_err());
    }

    #[test]
    fn worker_reports_initial_value_and_changes() {
        let dir = temp_device_dir("1\n");
        std::fs::write(dir.join("workload_type_index"), "2\n").unwrap();

        let monitor = Arc::new(WltMonitor::with_device_dir(&dir, None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.set_on_change(Arc::new(move |_name, old, new| {
            sink.lock().unwrap().push((old, new));
        }));

        let worker = Arc::clone(&monitor);
        let handle = std::thread::spawn(move || worker.run());

        std::thread::sleep(Duration::from_millis(100));
        std::fs::write(dir.join("workload_type_index"), "18\n").unwrap();
        // Plain files do not signal POLLPRI; wait out one poll budget so the
        // worker re-reads on timeout
        std::thread::sleep(timing::POLL_BUDGET + Duration::from_millis(300));

        monitor.stop();
        handle.join().unwrap();

        let events = seen.lock().unwrap().clone();
        assert!(events.contains(&(0, 2)), "initial observation missing: {:?}", events);
        assert!(events.contains(&(2, 18)), "change not reported: {:?}", events);
        let _ = std::fs::remove_dir_all(dir);
    }
}
