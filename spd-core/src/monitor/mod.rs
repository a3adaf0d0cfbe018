//! Monitor framework
//!
//! A monitor observes one integer-valued kernel signal on its own worker
//! thread and reports changes through an installed callback. The framework
//! guarantees:
//!
//! - `init()` runs once before `run()`; a failing monitor is excluded from
//!   the active set and the daemon continues with the rest.
//! - `run()` blocks on the monitor's worker until `stop()`; `pause()`,
//!   `resume()` and `stop()` take effect within the worker's poll budget.
//! - The change callback is invoked from the worker without any monitor lock
//!   held; consumers serialize on their side.

mod gpu_rc6;
mod hfi;
mod sysload;
mod wlt;

pub use gpu_rc6::GpuRc6Monitor;
pub use hfi::{CapabilityStream, CpuCapability, HfiMonitor, StreamFactory};
pub use sysload::{LoadEstimator, LoadSample, SysLoadMonitor};
pub use wlt::{WltCode, WltMonitor, SWLT_POWER_BIT};

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use spd_error::Result;
use tracing::{error, info};

/// Change-alert callback: `(monitor_name, old_value, new_value)`
pub type ChangeCallback = Arc<dyn Fn(&str, i32, i32) + Send + Sync>;

/// An observable integer source with a pausable worker loop
pub trait Monitor: Send + Sync {
    /// Stable name, unique within the process; used as the dispatch key
    fn name(&self) -> &'static str;

    /// One-time setup; an error excludes the monitor from the active set
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Worker body; blocks until `stop()` is observed
    fn run(&self);

    fn pause(&self);
    fn resume(&self);
    fn stop(&self);

    /// Install the change-alert callback invoked from the worker
    fn set_on_change(&self, cb: ChangeCallback);
}

/// Shrug off a poisoned lock; worker state stays usable after a panic
/// elsewhere.
pub(crate) fn relock<T>(r: std::result::Result<T, PoisonError<T>>) -> T {
    r.unwrap_or_else(PoisonError::into_inner)
}

/// Holder for the installed change callback.
///
/// The callback is cloned out under the lock and invoked with no lock held.
pub(crate) struct AlertSlot {
    cb: Mutex<Option<ChangeCallback>>,
}

impl AlertSlot {
    pub(crate) fn new() -> Self {
        Self { cb: Mutex::new(None) }
    }

    pub(crate) fn install(&self, cb: ChangeCallback) {
        *relock(self.cb.lock()) = Some(cb);
    }

    pub(crate) fn fire(&self, name: &str, old: i32, new: i32) {
        let cb = relock(self.cb.lock()).clone();
        if let Some(cb) = cb {
            cb(name, old, new);
        }
    }
}

struct GateState {
    paused: bool,
    stopped: bool,
}

/// Pause/stop gate shared by all monitor workers.
///
/// The worker parks in [`PauseGate::wait_ready`] while paused and sleeps
/// between samples in [`PauseGate::sleep`]; both return immediately once
/// `stop()` is called, and `sleep` also returns early on `pause()` so the
/// worker re-parks without finishing its interval.
pub(crate) struct PauseGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl PauseGate {
    pub(crate) fn new(start_paused: bool) -> Self {
        Self {
            state: Mutex::new(GateState { paused: start_paused, stopped: false }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn pause(&self) {
        relock(self.state.lock()).paused = true;
        self.cv.notify_all();
    }

    pub(crate) fn resume(&self) {
        relock(self.state.lock()).paused = false;
        self.cv.notify_all();
    }

    pub(crate) fn stop(&self) {
        let mut st = relock(self.state.lock());
        st.stopped = true;
        st.paused = false;
        drop(st);
        self.cv.notify_all();
    }

    pub(crate) fn is_paused(&self) -> bool {
        relock(self.state.lock()).paused
    }

    /// Block while paused. Returns `false` once the gate is stopped.
    pub(crate) fn wait_ready(&self) -> bool {
        let mut st = relock(self.state.lock());
        while st.paused && !st.stopped {
            st = relock(self.cv.wait(st));
        }
        !st.stopped
    }

    /// Sleep up to `duration`, waking early on pause or stop.
    /// Returns `false` once the gate is stopped.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut st = relock(self.state.lock());
        loop {
            if st.stopped {
                return false;
            }
            if st.paused {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = relock(self.cv.wait_timeout(st, deadline - now));
            st = guard;
        }
    }
}

/// Owns the admitted monitors and their worker threads.
///
/// Monitors are admitted through [`MonitorSet::admit`], which runs `init()`
/// and drops failing monitors from the active set. The set outlives every
/// worker; consumers hold only weak references to individual monitors.
pub struct MonitorSet {
    active: Vec<Arc<dyn Monitor>>,
    handles: Vec<JoinHandle<()>>,
}

impl MonitorSet {
    pub fn new() -> Self {
        Self { active: Vec::new(), handles: Vec::new() }
    }

    /// Initialize a monitor and add it to the active set.
    ///
    /// Returns `false` when `init()` fails; the monitor is excluded and the
    /// daemon keeps running with the remaining monitors.
    pub fn admit(&mut self, monitor: Arc<dyn Monitor>) -> bool {
        match monitor.init() {
            Ok(()) => {
                info!("{}: initialized", monitor.name());
                self.active.push(monitor);
                true
            }
            Err(e) => {
                error!(
                    "{}: initialization failed, excluded from active set: {}",
                    monitor.name(),
                    e
                );
                false
            }
        }
    }

    /// Spawn one named worker thread per admitted monitor.
    pub fn spawn_all(&mut self) {
        for monitor in &self.active {
            let worker = Arc::clone(monitor);
            match std::thread::Builder::new()
                .name(monitor.name().to_string())
                .spawn(move || worker.run())
            {
                Ok(handle) => self.handles.push(handle),
                Err(e) => error!("Failed to spawn worker for {}: {}", monitor.name(), e),
            }
        }
    }

    /// Request every worker to stop and join them.
    pub fn shutdown(&mut self) {
        for monitor in &self.active {
            monitor.stop();
        }
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("Worker '{}' panicked before shutdown", name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Default for MonitorSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spd_error::DaemonError;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingMonitor;

    impl Monitor for FailingMonitor {
        fn name(&self) -> &'static str {
            "FailingMonitor"
        }
        fn init(&self) -> Result<()> {
            Err(DaemonError::MonitorInit {
                name: self.name().into(),
                reason: "node missing".into(),
            })
        }
        fn run(&self) {}
        fn pause(&self) {}
        fn resume(&self) {}
        fn stop(&self) {}
        fn set_on_change(&self, _cb: ChangeCallback) {}
    }

    struct IdleMonitor {
        gate: PauseGate,
        ran: AtomicBool,
    }

    impl Monitor for IdleMonitor {
        fn name(&self) -> &'static str {
            "IdleMonitor"
        }
        fn run(&self) {
            self.ran.store(true, Ordering::SeqCst);
            while self.gate.wait_ready() {
                if !self.gate.sleep(Duration::from_secs(10)) {
                    break;
                }
            }
        }
        fn pause(&self) {
            self.gate.pause();
        }
        fn resume(&self) {
            self.gate.resume();
        }
        fn stop(&self) {
            self.gate.stop();
        }
        fn set_on_change(&self, _cb: ChangeCallback) {}
    }

    #[test]
    fn failing_init_is_excluded() {
        let mut set = MonitorSet::new();
        assert!(!set.admit(Arc::new(FailingMonitor)));
        assert!(set.is_empty());
    }

    #[test]
    fn stop_wakes_a_sleeping_worker_promptly() {
        let monitor = Arc::new(IdleMonitor {
            gate: PauseGate::new(false),
            ran: AtomicBool::new(false),
        });
        let mut set = MonitorSet::new();
        assert!(set.admit(monitor.clone()));
        set.spawn_all();

        // Give the worker a moment to enter its sleep
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        set.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(monitor.ran.load(Ordering::SeqCst));
    }

    #[test]
    fn pause_gate_sleep_returns_early_on_pause() {
        let gate = Arc::new(PauseGate::new(false));
        let gate2 = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            assert!(gate2.sleep(Duration::from_secs(10)));
            started.elapsed()
        });
        std::thread::sleep(Duration::from_millis(30));
        gate.pause();
        let elapsed = handle.join().unwrap();
        assert!(elapsed < Duration::from_secs(1));
        assert!(gate.is_paused());
    }

    #[test]
    fn alert_slot_fires_installed_callback() {
        let slot = AlertSlot::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slot.install(Arc::new(move |name: &str, old, new| {
            sink.lock().unwrap().push((name.to_string(), old, new));
        }));
        slot.fire("TestMonitor", 1, 2);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("TestMonitor".to_string(), 1, 2)]
        );
    }
}
