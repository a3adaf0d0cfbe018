//! socpowerd - SoC power-hint daemon
//!
//! Long-running service that watches kernel-exposed workload signals
//! (workload-type index, hardware-feedback efficiency, CPU load, GPU idle
//! residency), debounces them through a containment state machine, and
//! forwards power-mode hints to the platform power-management service.
//!
//! One worker thread per monitor, one per debounce timer, one coordinator
//! worker; the main thread only wires everything up and waits for a signal.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use spd_core::constants::paths;
use spd_core::{
    channel, forward_changes, Coordinator, CoordinatorOptions, Event, GpuRc6Monitor,
    HfiMonitor, Monitor, MonitorSet, PowerServiceClient, SignalSource, SocHint,
    SysLoadMonitor, ThermalGenlSocket, WltMonitor,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global shutdown flag for clean termination
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Runtime options assembled from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
struct DaemonOptions {
    send_hint: bool,
    soc_hint: SocHint,
    notification_delay_ms: Option<u32>,
    hint_socket: String,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            send_hint: false,
            soc_hint: SocHint::Wlt,
            notification_delay_ms: None,
            hint_socket: paths::HINT_SOCKET.to_string(),
        }
    }
}

fn print_help(program: &str) {
    println!(
        "Usage: {} [--sendHint <true|false>] [--socHint <wlt|swlt|hfi>] \
         [--notification-delay <ms>] [--hint-socket <path>] [--help]",
        program
    );
    println!("  --sendHint <true|false>    : Forward power hints to the power service (default: false)");
    println!("  --socHint <value>          : Primary hint driver. Allowed values: wlt, swlt, hfi (default: wlt)");
    println!("  --notification-delay <ms>  : Kernel notification delay; only valid with --socHint wlt or swlt");
    println!("  --hint-socket <path>       : Power service socket (default: {})", paths::HINT_SOCKET);
    println!("  --help, -h                 : Show this help message");
}

/// Parse argv; any error is reported by the caller and exits with status 1.
fn parse_args(args: &[String]) -> Result<DaemonOptions, String> {
    let mut send_hint = false;
    let mut soc_hint: Option<SocHint> = None;
    let mut notification_delay_ms: Option<u32> = None;
    let mut hint_socket = paths::HINT_SOCKET.to_string();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--sendHint" => {
                let value = args
                    .get(i + 1)
                    .ok_or("--sendHint requires a value (true or false)")?;
                send_hint = match value.as_str() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(format!(
                            "Invalid value for --sendHint: {}. Use true or false.",
                            other
                        ))
                    }
                };
                i += 1;
            }
            "--socHint" => {
                let value = args.get(i + 1).ok_or("--socHint requires a value")?;
                soc_hint = Some(SocHint::from_str(value)?);
                i += 1;
            }
            "--notification-delay" => {
                let value = args
                    .get(i + 1)
                    .ok_or("--notification-delay requires a value")?;
                let delay: u32 = value.parse().map_err(|_| {
                    format!("Invalid value for --notification-delay: {}", value)
                })?;
                notification_delay_ms = Some(delay);
                i += 1;
            }
            "--hint-socket" => {
                hint_socket = args
                    .get(i + 1)
                    .ok_or("--hint-socket requires a path")?
                    .clone();
                i += 1;
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("Unknown argument: {}", other)),
        }
        i += 1;
    }

    // The kernel delay node only exists for the workload-hint drivers
    if notification_delay_ms.is_some()
        && !matches!(soc_hint, Some(SocHint::Wlt) | Some(SocHint::Swlt))
    {
        return Err("--notification-delay is only valid with --socHint wlt or swlt".into());
    }

    Ok(DaemonOptions {
        send_hint,
        soc_hint: soc_hint.unwrap_or(SocHint::Wlt),
        notification_delay_ms,
        hint_socket,
    })
}

fn init_logging() {
    let filter = std::env::var("SOCPOWERD_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer journald on systemd hosts, fall back to stdout
    let mut use_journald = Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&filter))
                    .init();
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
                use_journald = false;
                tracing_subscriber::fmt()
                    .with_target(false)
                    .with_level(true)
                    .with_env_filter(&filter)
                    .init();
            }
        }
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .with_env_filter(&filter)
            .init();
    }

    info!(
        "STARTUP: Logging to {} (filter: {})",
        if use_journald { "systemd journal" } else { "stdout" },
        filter
    );
}

fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let program = argv
        .first()
        .map(String::as_str)
        .unwrap_or("socpowerd")
        .to_string();
    let options = match parse_args(&argv[1..]) {
        Ok(options) => options,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{}", message);
            }
            print_help(&program);
            std::process::exit(1);
        }
    };

    init_logging();
    info!("STARTUP: socpowerd {} starting", VERSION);
    info!("STARTUP: socHint={}", options.soc_hint.as_str());
    info!("STARTUP: sendHint={}", options.send_hint);
    if let Some(delay) = options.notification_delay_ms {
        info!("STARTUP: notification delay {} ms", delay);
    }

    // Event channel shared by all monitors and both debounce timers
    let (events_tx, events_rx) = channel();

    let mut monitors = MonitorSet::new();

    // Primary driver: the workload-hint drivers use the WLT monitor, the hfi
    // driver replaces it with the netlink consumer (and therefore never arms
    // the containment machine)
    match options.soc_hint {
        SocHint::Wlt | SocHint::Swlt => {
            let wlt = Arc::new(WltMonitor::new(options.notification_delay_ms));
            wlt.set_on_change(forward_changes(SignalSource::Wlt, events_tx.clone()));
            monitors.admit(wlt);
        }
        SocHint::Hfi => {
            let hfi = Arc::new(HfiMonitor::new(Box::new(|| {
                ThermalGenlSocket::open()
                    .map(|socket| Box::new(socket) as Box<dyn spd_core::CapabilityStream>)
            })));
            hfi.set_on_change(forward_changes(SignalSource::Hfi, events_tx.clone()));
            monitors.admit(hfi);
        }
    }

    // GPU idle monitor starts paused; the coordinator resumes it when the
    // workload classification turns active
    let gpu = Arc::new(GpuRc6Monitor::new());
    gpu.set_on_change(forward_changes(SignalSource::GpuRc6, events_tx.clone()));
    let gpu_ref = if monitors.admit(gpu.clone()) {
        Arc::downgrade(&gpu)
    } else {
        std::sync::Weak::new()
    };

    let sys_load = Arc::new(SysLoadMonitor::new());
    sys_load.set_on_change(forward_changes(SignalSource::SysLoad, events_tx.clone()));
    let sys_load_ref = if monitors.admit(sys_load.clone()) {
        Arc::downgrade(&sys_load)
    } else {
        std::sync::Weak::new()
    };

    if monitors.is_empty() {
        error!("No monitor could be initialized; nothing to observe");
        std::process::exit(1);
    }
    info!("STARTUP: {} monitors active", monitors.len());

    let sink = Arc::new(PowerServiceClient::new(&options.hint_socket));
    let coordinator = Coordinator::new(
        CoordinatorOptions::new(options.soc_hint, options.send_hint),
        sink,
        events_tx.clone(),
        events_rx,
        sys_load_ref,
        gpu_ref,
    );

    let coordinator_worker = std::thread::Builder::new()
        .name("coordinator".to_string())
        .spawn(move || coordinator.run())?;

    monitors.spawn_all();
    info!("STARTUP: monitoring started");

    let shutdown_tx = events_tx.clone();
    let main_thread = std::thread::current();
    ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        SHUTDOWN.store(true, Ordering::SeqCst);
        let _ = shutdown_tx.send(Event::Shutdown);
        main_thread.unpark();
    })?;

    // The workers carry the daemon from here
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::park_timeout(Duration::from_secs(60));
    }

    // Join the coordinator first; dropping it releases the event channel so
    // no monitor can stay blocked on a full queue while being stopped
    if coordinator_worker.join().is_err() {
        error!("Coordinator worker panicked during shutdown");
    }
    monitors.shutdown();
    info!("SHUTDOWN: socpowerd terminated gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_when_no_arguments() {
        let options = parse_args(&[]).unwrap();
        assert_eq!(options, DaemonOptions::default());
    }

    #[test]
    fn parses_full_flag_set() {
        let options = parse_args(&args(&[
            "--sendHint",
            "true",
            "--socHint",
            "swlt",
            "--notification-delay",
            "250",
            "--hint-socket",
            "/tmp/hints.sock",
        ]))
        .unwrap();
        assert!(options.send_hint);
        assert_eq!(options.soc_hint, SocHint::Swlt);
        assert_eq!(options.notification_delay_ms, Some(250));
        assert_eq!(options.hint_socket, "/tmp/hints.sock");
    }

    #[test]
    fn rejects_bad_send_hint_value() {
        assert!(parse_args(&args(&["--sendHint", "yes"])).is_err());
        assert!(parse_args(&args(&["--sendHint"])).is_err());
    }

    #[test]
    fn rejects_bad_soc_hint_value() {
        assert!(parse_args(&args(&["--socHint", "auto"])).is_err());
    }

    #[test]
    fn rejects_negative_or_garbage_delay() {
        assert!(parse_args(&args(&["--socHint", "wlt", "--notification-delay", "-5"])).is_err());
        assert!(parse_args(&args(&["--socHint", "wlt", "--notification-delay", "soon"])).is_err());
    }

    #[test]
    fn delay_requires_an_explicit_workload_driver() {
        // Without --socHint the delay has no driver to apply to
        assert!(parse_args(&args(&["--notification-delay", "100"])).is_err());
        assert!(parse_args(&args(&["--socHint", "hfi", "--notification-delay", "100"])).is_err());
        assert!(parse_args(&args(&["--socHint", "swlt", "--notification-delay", "100"])).is_ok());
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }
}
