//! A single background thread that runs short actions after a delay.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::{Task, panic_message};

static TIMER: LazyLock<Arc<Timer>> = LazyLock::new(Timer::start);

struct Entry {
    due: Instant,
    sequence: u64,
    action: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed, so that the binary heap pops the earliest entry first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Schedule {
    entries: BinaryHeap<Entry>,
    next_sequence: u64,
}

struct Timer {
    schedule: Mutex<Schedule>,
    changed: Condvar,
}

impl Timer {
    fn start() -> Arc<Self> {
        let timer = Arc::new(Self {
            schedule: Mutex::new(Schedule {
                entries: BinaryHeap::new(),
                next_sequence: 0,
            }),
            changed: Condvar::new(),
        });

        let worker = Arc::clone(&timer);
        thread::Builder::new()
            .name("dataflow-timer".to_owned())
            .spawn(move || {
                debug!("timer thread started");
                worker.run();
            })
            .expect("failed to spawn timer thread: thread spawning failure is not supported");

        timer
    }

    #[cfg_attr(test, mutants::skip)] // Never returns; mutations cannot be observed.
    fn run(&self) {
        loop {
            let action = self.next_due();

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
                error!(message = %panic_message(&*payload), "timer action panicked");
            }
        }
    }

    fn next_due(&self) -> Task {
        let mut schedule = self.schedule.lock();

        loop {
            let now = Instant::now();

            match schedule.entries.peek().map(|entry| entry.due) {
                None => self.changed.wait(&mut schedule),
                Some(due) if due <= now => {
                    if let Some(entry) = schedule.entries.pop() {
                        return entry.action;
                    }
                }
                Some(due) => {
                    self.changed.wait_until(&mut schedule, due);
                }
            }
        }
    }

    fn add(&self, delay: Duration, action: Task) {
        // A delay too long to represent never fires.
        let Some(due) = Instant::now().checked_add(delay) else {
            return;
        };

        let mut schedule = self.schedule.lock();
        let sequence = schedule.next_sequence;
        schedule.next_sequence = sequence.wrapping_add(1);
        schedule.entries.push(Entry {
            due,
            sequence,
            action,
        });
        drop(schedule);

        self.changed.notify_one();
    }
}

/// Runs `action` on the shared timer thread once `delay` has passed.
///
/// Actions run one at a time and must not block.
pub(crate) fn run_after<F>(delay: Duration, action: F)
where
    F: FnOnce() + Send + 'static,
{
    TIMER.add(delay, Box::new(action));
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use testing::with_watchdog;

    use super::*;
    use crate::Cell;

    #[test]
    fn actions_fire_in_due_order() {
        with_watchdog(|| {
            let order = Arc::new(Mutex::new(Vec::new()));
            let done = Cell::new();

            for (delay, label) in [(40, "late"), (10, "early"), (25, "middle")] {
                let order = Arc::clone(&order);
                let done = done.clone();
                run_after(Duration::from_millis(delay), move || {
                    let mut order = order.lock();
                    order.push(label);
                    if order.len() == 3 {
                        done.bind(());
                    }
                });
            }

            done.get().unwrap();
            assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
        });
    }

    #[test]
    fn action_does_not_fire_early() {
        with_watchdog(|| {
            let fired = Cell::new();
            let started = Instant::now();

            let target = fired.clone();
            run_after(Duration::from_millis(30), move || target.bind(Instant::now()));

            let fired_at = fired.get().unwrap();
            assert!(fired_at.duration_since(started) >= Duration::from_millis(30));
        });
    }
}
