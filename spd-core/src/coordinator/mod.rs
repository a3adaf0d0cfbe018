//! Event coordinator
//!
//! Single policy engine fusing every monitor's change stream. Monitors (and
//! the two debounce timers) post into one bounded channel; the coordinator
//! worker consumes that totally ordered event log, drives the containment
//! state machine, gates hint emission, and steers the GPU and CPU-load
//! monitors' pause state.
//!
//! # Containment state machine
//!
//! `Open` is initial. An idle or bottlenecked workload classification arms
//! the entry timer; if the smoothed CPU load is still low when it expires,
//! the coordinator enters `CoreContainment` and raises `EFFICIENT_POWER`.
//! While contained, an active classification arms the exit timer, which
//! releases containment only once load has risen by more than the slope
//! threshold since the workload became active; otherwise it re-arms with a
//! longer dwell. A busy-spike report from the CPU-load monitor bypasses the
//! exit timer entirely.

mod debounce;

pub use debounce::{DebounceTimer, TimerKind};

use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::constants::{coordinator as cfg, debounce as debounce_cfg, hints, load};
use crate::hint::HintSink;
use crate::monitor::{
    ChangeCallback, GpuRc6Monitor, Monitor, SysLoadMonitor, WltCode, SWLT_POWER_BIT,
};

/// Closed set of signal producers; resolved from monitor names at wiring time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Wlt,
    Hfi,
    SysLoad,
    GpuRc6,
}

impl SignalSource {
    pub fn from_name(name: &str) -> Option<Self> {
        use crate::constants::names;
        match name {
            names::WLT => Some(Self::Wlt),
            names::HFI => Some(Self::Hfi),
            names::SYS_LOAD => Some(Self::SysLoad),
            names::GPU_RC6 => Some(Self::GpuRc6),
            _ => None,
        }
    }
}

/// One entry of the coordinator's event log
#[derive(Debug, Clone, Copy)]
pub enum Event {
    /// A monitor observed an integer change
    Change { source: SignalSource, old: i32, new: i32 },
    /// A debounce timer ran to its deadline
    DebounceExpired { kind: TimerKind, generation: u64 },
    /// Stop the coordinator worker
    Shutdown,
}

/// Which primary signal drives hint policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocHint {
    /// Workload type drives the containment state machine
    Wlt,
    /// Workload type bit 4 maps statelessly to the power bias
    Swlt,
    /// Hardware-feedback efficiency capability maps statelessly
    Hfi,
}

impl SocHint {
    pub fn as_str(self) -> &'static str {
        match self {
            SocHint::Wlt => "wlt",
            SocHint::Swlt => "swlt",
            SocHint::Hfi => "hfi",
        }
    }
}

impl FromStr for SocHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wlt" => Ok(SocHint::Wlt),
            "swlt" => Ok(SocHint::Swlt),
            "hfi" => Ok(SocHint::Hfi),
            other => Err(format!("invalid socHint value '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainmentState {
    Open,
    CoreContainment,
}

/// Last value committed per hint key; `None` until the first emission
#[derive(Debug, Default, Clone, Copy)]
struct HintState {
    efficient: Option<bool>,
    gfx: Option<bool>,
}

/// Coordinator tunables; debounce overrides exist for tests
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub soc_hint: SocHint,
    pub send_hint_enabled: bool,
    pub entry_debounce: Duration,
    pub exit_debounce: Duration,
    pub exit_rearm: Duration,
}

impl CoordinatorOptions {
    pub fn new(soc_hint: SocHint, send_hint_enabled: bool) -> Self {
        Self {
            soc_hint,
            send_hint_enabled,
            entry_debounce: debounce_cfg::ENTRY,
            exit_debounce: debounce_cfg::EXIT_INITIAL,
            exit_rearm: debounce_cfg::EXIT_REARM,
        }
    }

    pub fn with_debounce(mut self, entry: Duration, exit: Duration, rearm: Duration) -> Self {
        self.entry_debounce = entry;
        self.exit_debounce = exit;
        self.exit_rearm = rearm;
        self
    }
}

/// Sending half of the coordinator event channel
pub type EventSender = Sender<Event>;
/// Receiving half of the coordinator event channel
pub type EventReceiver = Receiver<Event>;

/// Create the coordinator event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    bounded(cfg::EVENT_QUEUE_DEPTH)
}

/// Change callback that forwards a monitor's alerts into the event channel.
pub fn forward_changes(source: SignalSource, events: Sender<Event>) -> ChangeCallback {
    Arc::new(move |_name, old, new| {
        if let Err(e) = events.send(Event::Change { source, old, new }) {
            error!("Coordinator channel closed, dropping {:?} change: {}", source, e);
        }
    })
}

pub struct Coordinator {
    options: CoordinatorOptions,
    sink: Arc<dyn HintSink>,
    events: Receiver<Event>,
    entry_timer: DebounceTimer,
    exit_timer: DebounceTimer,
    state: ContainmentState,
    hints: HintState,
    /// EMA snapshot taken when the workload turned active inside containment
    latest_load_at_cc: f64,
    sys_load: Weak<SysLoadMonitor>,
    gpu: Weak<GpuRc6Monitor>,
}

impl Coordinator {
    pub fn new(
        options: CoordinatorOptions,
        sink: Arc<dyn HintSink>,
        events_tx: Sender<Event>,
        events_rx: Receiver<Event>,
        sys_load: Weak<SysLoadMonitor>,
        gpu: Weak<GpuRc6Monitor>,
    ) -> Self {
        Self {
            options,
            sink,
            events: events_rx,
            entry_timer: DebounceTimer::spawn(TimerKind::Entry, events_tx.clone()),
            exit_timer: DebounceTimer::spawn(TimerKind::Exit, events_tx),
            state: ContainmentState::Open,
            hints: HintState::default(),
            latest_load_at_cc: 0.0,
            sys_load,
            gpu,
        }
    }

    pub fn state(&self) -> ContainmentState {
        self.state
    }

    /// Last committed EFFICIENT_POWER value, if any
    pub fn efficient_hint(&self) -> Option<bool> {
        self.hints.efficient
    }

    /// Last committed GFX_MODE value, if any
    pub fn gfx_hint(&self) -> Option<bool> {
        self.hints.gfx
    }

    /// Consume events until `Event::Shutdown` or until every sender is gone.
    ///
    /// Returns the coordinator so final state is inspectable.
    pub fn run(mut self) -> Self {
        info!("Coordinator started ({} policy)", self.options.soc_hint.as_str());
        while let Ok(event) = self.events.recv() {
            match event {
                Event::Shutdown => break,
                Event::Change { source, old, new } => self.on_change(source, old, new),
                Event::DebounceExpired { kind, generation } => {
                    self.on_debounce_expired(kind, generation)
                }
            }
        }
        info!("Coordinator stopped");
        self
    }

    fn on_change(&mut self, source: SignalSource, old: i32, new: i32) {
        match source {
            SignalSource::Wlt => self.on_wlt(old, new),
            SignalSource::Hfi => {
                // Full efficiency capability means the platform wants the
                // efficient profile
                self.send_power_hint(new == 255, "HFI efficiency capability changed")
            }
            SignalSource::SysLoad => self.on_busy_spike(old, new),
            SignalSource::GpuRc6 => {
                self.send_gfx_hint(new == 1, "GPU load classification changed")
            }
        }
    }

    fn on_wlt(&mut self, old: i32, new: i32) {
        match self.options.soc_hint {
            SocHint::Wlt => self.drive_containment(old, new),
            SocHint::Swlt => {
                let power_biased = new & SWLT_POWER_BIT != 0;
                let reason = if power_biased {
                    "workload type requests power bias"
                } else {
                    "workload type requests performance bias"
                };
                self.send_power_hint(power_biased, reason);
            }
            SocHint::Hfi => {
                debug!("Ignoring WLT change under hfi policy");
            }
        }
    }

    fn drive_containment(&mut self, old: i32, new: i32) {
        let new_code = WltCode::from_raw(new);
        let old_code = WltCode::from_raw(old);
        info!("New WLT={} ({:?})", new, new_code);

        match self.state {
            ContainmentState::CoreContainment => {
                if !old_code.is_active() && new_code.is_active() {
                    self.latest_load_at_cc = self.latest_load();
                    info!(
                        "Contained workload turned active; load baseline {:.2}%",
                        self.latest_load_at_cc
                    );
                }
                // Keep the EMA fresh between periodic ticks while contained
                self.sample_load();

                if new_code.is_active() {
                    if !self.exit_timer.is_armed() {
                        info!("Active workload in containment; exit debounce started");
                        self.exit_timer.arm(self.options.exit_debounce);
                    }
                    self.set_gpu_paused(false);
                } else {
                    if self.exit_timer.is_armed() {
                        info!("Workload idle again; exit debounce cancelled");
                        self.exit_timer.cancel();
                    }
                    self.set_gpu_paused(true);
                }
            }
            ContainmentState::Open => match new_code {
                WltCode::Idle | WltCode::Btl => {
                    if !self.entry_timer.is_armed() {
                        info!("Idle workload while open; entry debounce started");
                        self.entry_timer.arm(self.options.entry_debounce);
                    }
                    self.set_gpu_paused(true);
                }
                WltCode::Sustain => {
                    if self.entry_timer.is_armed() {
                        info!("Sustained workload; entry debounce cancelled");
                        self.entry_timer.cancel();
                    }
                    self.set_gpu_paused(false);
                }
                WltCode::Bursty => {
                    self.set_gpu_paused(false);
                }
            },
        }
    }

    fn on_busy_spike(&mut self, old: i32, new: i32) {
        info!("Busy spike reported: smoothed load {} -> {}", old, new);
        if self.state != ContainmentState::CoreContainment {
            return;
        }
        self.state = ContainmentState::Open;
        if self.exit_timer.is_armed() {
            self.exit_timer.cancel();
        }
        self.send_power_hint(false, "busy spike while contained");
    }

    fn on_debounce_expired(&mut self, kind: TimerKind, generation: u64) {
        let current = match kind {
            TimerKind::Entry => self.entry_timer.generation(),
            TimerKind::Exit => self.exit_timer.generation(),
        };
        if generation != current {
            debug!("Discarding stale {:?} expiry (generation {})", kind, generation);
            return;
        }
        match kind {
            TimerKind::Entry => self.on_entry_expired(),
            TimerKind::Exit => self.on_exit_expired(),
        }
    }

    fn on_entry_expired(&mut self) {
        if self.state != ContainmentState::Open {
            debug!("Entry debounce expired outside Open; no action");
            return;
        }
        let current = self.sample_load();
        info!("Entry debounce expired with CPU load {:.2}%", current);
        if current < load::HIGH_THRESHOLD_PERCENT {
            self.state = ContainmentState::CoreContainment;
            self.send_power_hint(true, "entry debounce expired under low load");
        } else {
            info!("System load is high; staying open");
        }
    }

    fn on_exit_expired(&mut self) {
        if self.state != ContainmentState::CoreContainment {
            debug!("Exit debounce expired outside containment; no action");
            return;
        }
        let current = self.sample_load();
        let slope = current - self.latest_load_at_cc;
        info!(
            "Exit debounce expired with CPU load {:.2}% (baseline {:.2}%, slope {:.2})",
            current, self.latest_load_at_cc, slope
        );
        if slope > load::SLOPE_THRESHOLD_PERCENT {
            self.state = ContainmentState::Open;
            self.send_power_hint(false, "exit debounce expired with rising load");
        } else {
            info!("Load has not risen; exit debounce re-armed");
            self.exit_timer.arm(self.options.exit_rearm);
        }
    }

    /// Commit an EFFICIENT_POWER value: forward it when it differs from the
    /// last committed value, and couple the CPU-load monitor to it (the
    /// busy-spike detector only runs while containment is engaged).
    fn send_power_hint(&mut self, enable: bool, reason: &str) {
        if self.hints.efficient == Some(enable) {
            debug!("EFFICIENT_POWER already {} ({})", enable, reason);
            return;
        }
        if self.options.send_hint_enabled {
            match self.sink.send_hint(hints::EFFICIENT_POWER, enable) {
                // The value is cached either way; a failed dispatch is not
                // retried to avoid hammering a sick service
                Ok(()) => info!("Sent EFFICIENT_POWER={} ({})", enable, reason),
                Err(e) => error!("EFFICIENT_POWER dispatch failed ({}): {}", reason, e),
            }
        } else {
            info!("{} but hint forwarding is disabled", reason);
        }
        self.hints.efficient = Some(enable);
        self.set_sys_load_running(enable);
    }

    fn send_gfx_hint(&mut self, enable: bool, reason: &str) {
        if self.hints.gfx == Some(enable) {
            debug!("GFX_MODE already {} ({})", enable, reason);
            return;
        }
        if self.options.send_hint_enabled {
            match self.sink.send_hint(hints::GFX_MODE, enable) {
                Ok(()) => info!("Sent GFX_MODE={} ({})", enable, reason),
                Err(e) => error!("GFX_MODE dispatch failed ({}): {}", reason, e),
            }
        } else {
            info!("{} but hint forwarding is disabled", reason);
        }
        self.hints.gfx = Some(enable);
    }

    fn sample_load(&self) -> f64 {
        match self.sys_load.upgrade() {
            Some(monitor) => monitor.sample_and_get(),
            None => load::NO_SAMPLE,
        }
    }

    fn latest_load(&self) -> f64 {
        match self.sys_load.upgrade() {
            Some(monitor) => monitor.latest(),
            None => load::NO_SAMPLE,
        }
    }

    fn set_gpu_paused(&self, paused: bool) {
        if let Some(gpu) = self.gpu.upgrade() {
            if paused {
                gpu.pause();
            } else {
                gpu.resume();
            }
        }
    }

    fn set_sys_load_running(&self, running: bool) {
        if let Some(monitor) = self.sys_load.upgrade() {
            if running {
                monitor.resume();
            } else {
                monitor.pause();
            }
        }
    }
}
