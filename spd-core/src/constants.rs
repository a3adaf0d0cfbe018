//! Constants and configuration values for socpowerd
//!
//! Centralizes magic numbers, kernel paths, and tunable defaults.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// Kernel file interfaces
pub mod paths {
    /// Aggregate CPU tick counters
    pub const PROC_STAT: &str = "/proc/stat";

    /// Platform workload-hint device directory
    pub const WORKLOAD_HINT_DIR: &str =
        "/sys/devices/pci0000:00/0000:00:04.0/workload_hint";

    /// Workload type classification index (POLLPRI-capable)
    pub const WORKLOAD_TYPE_INDEX: &str =
        "/sys/devices/pci0000:00/0000:00:04.0/workload_hint/workload_type_index";

    /// Kernel feature gate for workload hints ("0" / "1")
    pub const WORKLOAD_HINT_ENABLE: &str =
        "/sys/devices/pci0000:00/0000:00:04.0/workload_hint/workload_hint_enable";

    /// Debounce delay applied by the kernel before notifying (decimal ms)
    pub const WORKLOAD_NOTIFICATION_DELAY: &str =
        "/sys/devices/pci0000:00/0000:00:04.0/workload_hint/notification_delay_ms";

    /// Monotonic GPU idle-residency counter in milliseconds
    pub const GPU_IDLE_RESIDENCY: &str =
        "/sys/class/drm/card0/device/tile0/gt0/gtidle/idle_residency_ms";

    /// Default Unix socket of the platform power-management service
    pub const HINT_SOCKET: &str = "/run/powerhintd.sock";
}

/// Load estimation tunables
pub mod load {
    use super::Duration;

    /// EMA time constant for irregular sampling intervals (seconds)
    pub const EMA_TAU_SECS: f64 = 1.5;

    /// Smoothed load above this percentage counts as a busy spike
    pub const HIGH_THRESHOLD_PERCENT: f64 = 25.0;

    /// Load must rise by more than this much between exit-debounce checks
    /// for containment to be abandoned
    pub const SLOPE_THRESHOLD_PERCENT: f64 = 5.0;

    /// Periodic sampling interval of the CPU-load worker
    pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(3);

    /// Returned by estimator accessors before the first defined sample
    pub const NO_SAMPLE: f64 = -1.0;
}

/// GPU idle-residency tunables
pub mod gpu {
    use super::Duration;

    /// Poll window; also the divisor converting a residency delta to percent
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

    /// Idle residency at or below this percentage means high GPU load
    pub const HIGH_LOAD_IDLE_PERCENT: f64 = 40.0;

    /// Maximum latency for pause()/resume()/stop() to take effect
    pub const WAKE_SLICE: Duration = Duration::from_millis(200);

    /// Consecutive read failures are logged on the first and then every
    /// this-many occurrences, so a dead counter node cannot flood the log
    pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;
}

/// Debounce timer durations
pub mod debounce {
    use super::Duration;

    /// Dwell before committing to core containment
    pub const ENTRY: Duration = Duration::from_secs(10);

    /// Initial dwell before leaving core containment
    pub const EXIT_INITIAL: Duration = Duration::from_secs(1);

    /// Longer re-arm used when load has not risen enough at exit expiry
    pub const EXIT_REARM: Duration = Duration::from_secs(5);
}

/// Timing shared across monitor workers
pub mod timing {
    use super::Duration;

    /// Upper bound on any blocking wait so stop()/pause() are observed promptly
    pub const POLL_BUDGET: Duration = Duration::from_secs(1);

    /// Back-off after a failed poll() before retrying
    pub const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);
}

/// Hint keys understood by the platform power-management service
pub mod hints {
    pub const EFFICIENT_POWER: &str = "EFFICIENT_POWER";
    pub const GFX_MODE: &str = "GFX_MODE";
}

/// Generic-netlink identifiers for the hardware-feedback interface
pub mod netlink {
    /// Thermal generic-netlink family
    pub const THERMAL_FAMILY: &str = "thermal";

    /// Multicast group carrying thermal events
    pub const THERMAL_EVENT_GROUP: &str = "thermal_event";

    /// genlmsghdr command for per-CPU capability updates
    pub const CPU_CAPABILITY_CHANGE: u8 = 14;

    /// Nested attribute holding the flat (cpu, perf, eff) tuple sequence
    pub const ATTR_CPU_CAPABILITY: u16 = 17;

    /// perf/eff arrive left-shifted by this amount; shift right to restore [0,255]
    pub const CAPABILITY_SCALE_SHIFT: u32 = 2;

    /// Receive timeout so stop() is observed without a message arriving
    pub const RECV_TIMEOUT_SECS: u32 = 1;
}

/// Coordinator event channel sizing
pub mod coordinator {
    /// Bounded depth of the event channel; full means monitor workers
    /// backpressure rather than drop events
    pub const EVENT_QUEUE_DEPTH: usize = 64;
}

/// Stable monitor names used as dispatch keys and thread names
pub mod names {
    pub const WLT: &str = "WltMonitor";
    pub const HFI: &str = "HfiMonitor";
    pub const SYS_LOAD: &str = "SysLoadMonitor";
    pub const GPU_RC6: &str = "GpuRc6Monitor";
}
