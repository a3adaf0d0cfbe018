/*
 * Integration tests for the spd-core monitoring pipeline
 *
 * These tests wire real monitors, the event channel, and the coordinator
 * together over temp-file stand-ins for the kernel interfaces, and observe
 * the hints arriving at a recording sink.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use spd_core::constants::hints;
use spd_core::{
    channel, forward_changes, ContainmentState, Coordinator, CoordinatorOptions, Event,
    EventSender, GpuRc6Monitor, Monitor, MonitorSet, RecordingSink, SignalSource,
    SocHint, SysLoadMonitor, WltMonitor,
};

const ENTRY: Duration = Duration::from_millis(150);
const EXIT: Duration = Duration::from_millis(100);
const REARM: Duration = Duration::from_millis(200);

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("spd-it-{}-{}", std::process::id(), tag))
}

/// A stat file whose since-boot window reads as `busy_percent` busy
fn write_stat(path: &PathBuf, busy_percent: u64) {
    let total = 1000u64;
    let idle = total - busy_percent * 10;
    std::fs::write(
        path,
        format!("cpu  {} 0 0 {} 0 0 0 0 0 0\n", total - idle, idle),
    )
    .unwrap();
}

struct Pipeline {
    tx: EventSender,
    sink: Arc<RecordingSink>,
    worker: std::thread::JoinHandle<Coordinator>,
}

fn start_pipeline(
    soc_hint: SocHint,
    sys_load: &Arc<SysLoadMonitor>,
    gpu: &Arc<GpuRc6Monitor>,
) -> Pipeline {
    let (tx, rx) = channel();
    let sink = Arc::new(RecordingSink::new());
    let coordinator = Coordinator::new(
        CoordinatorOptions::new(soc_hint, true).with_debounce(ENTRY, EXIT, REARM),
        sink.clone(),
        tx.clone(),
        rx,
        Arc::downgrade(sys_load),
        Arc::downgrade(gpu),
    );
    let worker = std::thread::spawn(move || coordinator.run());
    Pipeline { tx, sink, worker }
}

impl Pipeline {
    fn finish(self) -> (Coordinator, Arc<RecordingSink>) {
        self.tx.send(Event::Shutdown).unwrap();
        (self.worker.join().unwrap(), self.sink)
    }
}

#[test]
#[serial]
fn containment_is_entered_under_low_measured_load() {
    let stat = temp_path("stat-low");
    write_stat(&stat, 10);
    let sys_load = Arc::new(SysLoadMonitor::with_source(&stat, Duration::from_secs(3)));
    let gpu = Arc::new(GpuRc6Monitor::with_source("/nonexistent", Duration::from_secs(1)));

    let pipeline = start_pipeline(SocHint::Wlt, &sys_load, &gpu);
    pipeline
        .tx
        .send(Event::Change { source: SignalSource::Wlt, old: 0, new: 0 })
        .unwrap();
    std::thread::sleep(ENTRY + Duration::from_millis(100));

    let (coordinator, sink) = pipeline.finish();
    assert_eq!(coordinator.state(), ContainmentState::CoreContainment);
    assert_eq!(sink.sent_for(hints::EFFICIENT_POWER), vec![true]);
    // Raising the hint resumes the busy-spike detector
    assert!(!sys_load.is_paused());
    let _ = std::fs::remove_file(stat);
}

#[test]
#[serial]
fn containment_is_refused_under_high_measured_load() {
    let stat = temp_path("stat-high");
    write_stat(&stat, 80);
    let sys_load = Arc::new(SysLoadMonitor::with_source(&stat, Duration::from_secs(3)));
    let gpu = Arc::new(GpuRc6Monitor::with_source("/nonexistent", Duration::from_secs(1)));

    let pipeline = start_pipeline(SocHint::Wlt, &sys_load, &gpu);
    pipeline
        .tx
        .send(Event::Change { source: SignalSource::Wlt, old: 0, new: 1 })
        .unwrap();
    std::thread::sleep(ENTRY + Duration::from_millis(100));

    let (coordinator, sink) = pipeline.finish();
    assert_eq!(coordinator.state(), ContainmentState::Open);
    assert!(sink.sent().is_empty());
    let _ = std::fs::remove_file(stat);
}

#[test]
#[serial]
fn wlt_monitor_drives_the_machine_end_to_end() {
    // Fake workload-hint device directory
    let dir = temp_path("wlt-dev");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("workload_hint_enable"), "1\n").unwrap();
    std::fs::write(dir.join("workload_type_index"), "0\n").unwrap();

    let stat = temp_path("stat-e2e");
    write_stat(&stat, 5);
    let sys_load = Arc::new(SysLoadMonitor::with_source(&stat, Duration::from_secs(3)));
    let gpu = Arc::new(GpuRc6Monitor::with_source("/nonexistent", Duration::from_secs(1)));

    let pipeline = start_pipeline(SocHint::Wlt, &sys_load, &gpu);

    let wlt = Arc::new(WltMonitor::with_device_dir(&dir, None));
    wlt.set_on_change(forward_changes(SignalSource::Wlt, pipeline.tx.clone()));
    let mut monitors = MonitorSet::new();
    assert!(monitors.admit(wlt));
    monitors.spawn_all();

    // The monitor reports the initial Idle observation, which arms the entry
    // debounce; low load lets it commit
    std::thread::sleep(ENTRY + Duration::from_millis(250));
    monitors.shutdown();

    let (coordinator, sink) = pipeline.finish();
    assert_eq!(coordinator.state(), ContainmentState::CoreContainment);
    assert_eq!(sink.sent_for(hints::EFFICIENT_POWER), vec![true]);

    let _ = std::fs::remove_file(stat);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
#[serial]
fn gpu_monitor_classifies_residency_once_resumed() {
    let residency = temp_path("residency");
    std::fs::write(&residency, "100000\n").unwrap();

    let stat = temp_path("stat-gpu");
    write_stat(&stat, 50);
    let sys_load = Arc::new(SysLoadMonitor::with_source(&stat, Duration::from_secs(3)));
    let gpu = Arc::new(GpuRc6Monitor::with_source(&residency, Duration::from_millis(150)));

    let pipeline = start_pipeline(SocHint::Wlt, &sys_load, &gpu);

    let mut monitors = MonitorSet::new();
    assert!(monitors.admit(gpu.clone()));
    monitors.spawn_all();
    assert!(gpu.is_paused());

    // Sustain resumes the GPU monitor
    pipeline
        .tx
        .send(Event::Change { source: SignalSource::Wlt, old: 0, new: 2 })
        .unwrap();

    // First window establishes the baseline; the busy window (30ms idle out
    // of 150ms, 20% idle) then classifies as high GPU load
    std::thread::sleep(Duration::from_millis(220));
    std::fs::write(&residency, "100030\n").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // A mostly-idle window (150ms out of 150ms) flips it back
    std::fs::write(&residency, "100230\n").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    monitors.shutdown();
    let (_, sink) = pipeline.finish();
    assert_eq!(sink.sent_for(hints::GFX_MODE), vec![true, false]);

    let _ = std::fs::remove_file(residency);
    let _ = std::fs::remove_file(stat);
}

#[test]
#[serial]
fn sys_load_pause_resume_round_trip_keeps_sampling() {
    let stat = temp_path("stat-roundtrip");
    write_stat(&stat, 30);
    let monitor = Arc::new(SysLoadMonitor::with_source(&stat, Duration::from_millis(50)));

    let mut monitors = MonitorSet::new();
    assert!(monitors.admit(monitor.clone()));
    monitors.spawn_all();

    monitor.resume();
    std::thread::sleep(Duration::from_millis(120));
    let before = monitor.latest();
    assert!(before > 0.0);

    monitor.pause();
    std::thread::sleep(Duration::from_millis(60));
    monitor.resume();
    std::thread::sleep(Duration::from_millis(120));
    // Still sampling after the round trip; the estimate stays defined and
    // in range
    let after = monitor.latest();
    assert!((0.0..=100.0).contains(&after));

    monitors.shutdown();
    let _ = std::fs::remove_file(stat);
}

#[test]
fn disabled_forwarding_still_updates_the_gate() {
    let (tx, rx) = channel();
    let sink = Arc::new(RecordingSink::new());
    let sys_load = Arc::new(SysLoadMonitor::with_source("/nonexistent", Duration::from_secs(3)));
    let gpu = Arc::new(GpuRc6Monitor::with_source("/nonexistent", Duration::from_secs(1)));

    let coordinator = Coordinator::new(
        CoordinatorOptions::new(SocHint::Swlt, false).with_debounce(ENTRY, EXIT, REARM),
        sink.clone(),
        tx.clone(),
        rx,
        Arc::downgrade(&sys_load),
        Arc::downgrade(&gpu),
    );
    let worker = std::thread::spawn(move || coordinator.run());

    // Power-biased, then performance-biased workload types
    tx.send(Event::Change { source: SignalSource::Wlt, old: 0, new: 0x12 }).unwrap();
    tx.send(Event::Change { source: SignalSource::Wlt, old: 0x12, new: 0x02 }).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    tx.send(Event::Shutdown).unwrap();
    let coordinator = worker.join().unwrap();

    // Nothing was forwarded, but the cached value tracked the changes
    assert!(sink.sent().is_empty());
    assert_eq!(coordinator.efficient_hint(), Some(false));
}
