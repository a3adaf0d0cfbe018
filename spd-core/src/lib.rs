//! socpowerd Core Library
//!
//! Observes kernel-exposed workload signals, fuses them in a debounced
//! containment state machine, and issues power-mode hints to the platform
//! power-management service.
//!
//! # Module Structure
//!
//! - `monitor/` - Monitor framework and the four concrete monitors
//!   (workload type, hardware feedback, CPU load, GPU idle residency)
//! - `coordinator/` - Containment state machine, debounce timers, dispatch
//! - `hint` - Hint-sink trait and the power-service client adapter
//! - `netlink` - Generic-netlink consumer feeding the HFI monitor
//! - `sysfs` - Kernel file-interface helpers
//! - `constants` - Paths, thresholds, and timing in one place
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spd_core::{
//!     channel, forward_changes, Coordinator, CoordinatorOptions, Monitor,
//!     MonitorSet, PowerServiceClient, SignalSource, SocHint, SysLoadMonitor,
//! };
//!
//! let (tx, rx) = channel();
//! let sys_load = Arc::new(SysLoadMonitor::new());
//! sys_load.set_on_change(forward_changes(SignalSource::SysLoad, tx.clone()));
//!
//! let mut monitors = MonitorSet::new();
//! monitors.admit(sys_load.clone());
//!
//! let sink = Arc::new(PowerServiceClient::new("/run/powerhintd.sock"));
//! let coordinator = Coordinator::new(
//!     CoordinatorOptions::new(SocHint::Wlt, false),
//!     sink,
//!     tx,
//!     rx,
//!     Arc::downgrade(&sys_load),
//!     std::sync::Weak::new(),
//! );
//! # let _ = coordinator;
//! ```

pub mod constants;
pub mod coordinator;
pub mod hint;
pub mod monitor;
pub mod netlink;
pub mod sysfs;

// Re-export the primary types
pub use coordinator::{
    channel, forward_changes, ContainmentState, Coordinator, CoordinatorOptions,
    DebounceTimer, Event, EventReceiver, EventSender, SignalSource, SocHint, TimerKind,
};
pub use hint::{HintSink, PowerServiceClient, RecordingSink};
pub use monitor::{
    CapabilityStream, ChangeCallback, CpuCapability, GpuRc6Monitor, HfiMonitor,
    LoadEstimator, LoadSample, Monitor, MonitorSet, StreamFactory, SysLoadMonitor,
    WltCode, WltMonitor, SWLT_POWER_BIT,
};
pub use netlink::ThermalGenlSocket;

// Re-export the unified error types
pub use spd_error::{DaemonError, Result};
