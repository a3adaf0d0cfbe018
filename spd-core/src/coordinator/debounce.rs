//! Debounce timers for containment entry and exit
//!
//! Each timer owns a dedicated worker parked on a condvar. Arming sets a
//! deadline and bumps a generation counter; cancelling disarms and bumps the
//! generation as well. An expiry posts a [`Event::DebounceExpired`] stamped
//! with the generation it was armed under, so the coordinator can discard
//! expiries that raced with a cancel or re-arm. At most one expiry is posted
//! per arm.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, error};

use crate::coordinator::Event;
use crate::monitor::relock;

/// Which of the two coordinator timers fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Entry,
    Exit,
}

impl TimerKind {
    fn worker_name(self) -> &'static str {
        match self {
            TimerKind::Entry => "entry-debounce",
            TimerKind::Exit => "exit-debounce",
        }
    }
}

struct TimerState {
    armed: bool,
    deadline: Instant,
    generation: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
}

pub struct DebounceTimer {
    kind: TimerKind,
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    /// Spawn the timer worker; expiries are posted to `events`.
    pub fn spawn(kind: TimerKind, events: Sender<Event>) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                armed: false,
                deadline: Instant::now(),
                generation: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(kind.worker_name().to_string())
            .spawn(move || timer_worker(kind, worker_shared, events))
            .map_err(|e| error!("Failed to spawn {} worker: {}", kind.worker_name(), e))
            .ok();

        Self { kind, shared, worker }
    }

    /// Arm (or re-arm) for `duration` from now.
    pub fn arm(&self, duration: Duration) {
        let mut st = relock(self.shared.state.lock());
        st.generation += 1;
        st.armed = true;
        st.deadline = Instant::now() + duration;
        debug!(
            "{}: armed for {:?} (generation {})",
            self.kind.worker_name(),
            duration,
            st.generation
        );
        drop(st);
        self.shared.cv.notify_all();
    }

    /// Disarm; a pending expiry for the current arm is suppressed.
    pub fn cancel(&self) {
        let mut st = relock(self.shared.state.lock());
        st.armed = false;
        st.generation += 1;
        debug!("{}: cancelled", self.kind.worker_name());
        drop(st);
        self.shared.cv.notify_all();
    }

    pub fn is_armed(&self) -> bool {
        relock(self.shared.state.lock()).armed
    }

    /// Current generation; expiry events carrying an older stamp are stale.
    pub fn generation(&self) -> u64 {
        relock(self.shared.state.lock()).generation
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        {
            let mut st = relock(self.shared.state.lock());
            st.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn timer_worker(kind: TimerKind, shared: Arc<TimerShared>, events: Sender<Event>) {
    let mut st = relock(shared.state.lock());
    'outer: loop {
        while !st.armed {
            if st.shutdown {
                return;
            }
            st = relock(shared.cv.wait(st));
        }
        if st.shutdown {
            return;
        }

        let generation = st.generation;
        let deadline = st.deadline;
        loop {
            if st.shutdown {
                return;
            }
            if !st.armed || st.generation != generation {
                // Cancelled or re-armed; pick up the new state
                continue 'outer;
            }
            let now = Instant::now();
            if now >= deadline {
                st.armed = false;
                drop(st);
                let _ = events.send(Event::DebounceExpired { kind, generation });
                st = relock(shared.state.lock());
                continue 'outer;
            }
            let (guard, _) = relock(shared.cv.wait_timeout(st, deadline - now));
            st = guard;
        }
    }
}
