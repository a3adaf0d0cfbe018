//! Hardware-feedback-interface (HFI) monitor
//!
//! Consumes per-CPU capability updates from a [`CapabilityStream`] (in
//! production the thermal generic-netlink multicast group) and tracks the
//! efficiency capability as a single scalar: a change reported for any CPU
//! moves the global value. The change alert fires only when that scalar
//! moves.

use std::sync::Mutex;

use spd_error::{DaemonError, Result};
use tracing::{error, info};

use crate::constants::{names, timing};
use crate::monitor::{relock, AlertSlot, ChangeCallback, Monitor, PauseGate};

/// One decoded capability tuple, already scaled back to [0, 255]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCapability {
    pub cpu: u32,
    pub perf: u32,
    pub eff: u32,
}

/// Source of capability updates.
///
/// Implementations block for at most their internal receive timeout; a
/// timeout or an event-free message is reported as `Ok(None)` so the caller
/// can observe pause/stop requests between waits.
pub trait CapabilityStream: Send {
    fn next_capabilities(&mut self) -> Result<Option<Vec<CpuCapability>>>;
}

/// Deferred stream construction so socket setup happens in `init()` and a
/// failure excludes only this monitor.
pub type StreamFactory =
    Box<dyn Fn() -> Result<Box<dyn CapabilityStream>> + Send + Sync>;

pub struct HfiMonitor {
    gate: PauseGate,
    alert: AlertSlot,
    factory: StreamFactory,
    stream: Mutex<Option<Box<dyn CapabilityStream>>>,
    efficient_power: Mutex<u32>,
}

impl HfiMonitor {
    pub fn new(factory: StreamFactory) -> Self {
        Self {
            gate: PauseGate::new(false),
            alert: AlertSlot::new(),
            factory,
            stream: Mutex::new(None),
            efficient_power: Mutex::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Fold a batch of tuples into the scalar; the last tuple of a message
    /// carries the value that sticks.
    fn track(&self, capabilities: &[CpuCapability]) {
        let Some(cap) = capabilities.last() else {
            return;
        };
        let mut current = relock(self.efficient_power.lock());
        if cap.eff != *current {
            let old = *current;
            *current = cap.eff;
            drop(current);
            info!(
                "{}: cpu={} perf={} eff {} -> {}",
                self.name(),
                cap.cpu,
                cap.perf,
                old,
                cap.eff
            );
            self.alert.fire(self.name(), old as i32, cap.eff as i32);
        }
    }
}

impl Monitor for HfiMonitor {
    fn name(&self) -> &'static str {
        names::HFI
    }

    fn init(&self) -> Result<()> {
        let stream = (self.factory)().map_err(|e| DaemonError::MonitorInit {
            name: self.name().into(),
            reason: e.to_string(),
        })?;
        *relock(self.stream.lock()) = Some(stream);
        Ok(())
    }

    fn run(&self) {
        info!("{}: worker started", self.name());
        loop {
            if !self.gate.wait_ready() {
                break;
            }

            let batch = {
                let mut slot = relock(self.stream.lock());
                let Some(stream) = slot.as_mut() else {
                    error!("{}: no capability stream; worker exiting", self.name());
                    break;
                };
                stream.next_capabilities()
            };

            match batch {
                Ok(Some(capabilities)) => self.track(&capabilities),
                Ok(None) => {}
                Err(e) => {
                    error!("{}: receive failed: {}", self.name(), e);
                    if !self.gate.sleep(timing::POLL_ERROR_BACKOFF) {
                        break;
                    }
                }
            }
        }
        info!("{}: worker exiting", self.name());
    }

    fn pause(&self) {
        info!("{}: paused", self.name());
        self.gate.pause();
    }

    fn resume(&self) {
        info!("{}: resumed", self.name());
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
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    struct ScriptedStream {
        batches: VecDeque<Vec<CpuCapability>>,
    }

    impl CapabilityStream for ScriptedStream {
        fn next_capabilities(&mut self) -> Result<Option<Vec<CpuCapability>>> {
            match self.batches.pop_front() {
                Some(batch) => Ok(Some(batch)),
                None => {
                    // Nothing scripted; behave like a receive timeout
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(None)
                }
            }
        }
    }

    fn scripted(batches: Vec<Vec<CpuCapability>>) -> StreamFactory {
        let batches = Mutex::new(Some(batches));
        Box::new(move || {
            let taken = batches.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedStream { batches: taken.into() }) as Box<dyn CapabilityStream>)
        })
    }

    fn cap(cpu: u32, eff: u32) -> CpuCapability {
        CpuCapability { cpu, perf: 128, eff }
    }

    #[test]
    fn fires_only_when_eff_moves() {
        let monitor = Arc::new(HfiMonitor::new(scripted(vec![
            vec![cap(0, 255)],
            vec![cap(1, 255)],
            vec![cap(0, 128)],
        ])));
        monitor.init().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.set_on_change(Arc::new(move |_name, old, new| {
            sink.lock().unwrap().push((old, new));
        }));

        let worker = Arc::clone(&monitor);
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(150));
        monitor.stop();
        handle.join().unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[(0, 255), (255, 128)]);
    }

    #[test]
    fn last_tuple_of_a_batch_wins() {
        let monitor = Arc::new(HfiMonitor::new(scripted(vec![vec![
            cap(0, 255),
            cap(1, 64),
        ]])));
        monitor.init().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.set_on_change(Arc::new(move |_name, old, new| {
            sink.lock().unwrap().push((old, new));
        }));

        let worker = Arc::clone(&monitor);
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(100));
        monitor.stop();
        handle.join().unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[(0, 64)]);
    }

    #[test]
    fn failing_factory_fails_init() {
        let monitor = HfiMonitor::new(Box::new(|| {
            Err(DaemonError::NetlinkResolve {
                family: "thermal".into(),
                reason: "family not registered".into(),
            })
        }));
        assert!(monitor.init().is_err());
    }
}
