#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples of the dataflow packages.

use std::env;
use std::panic;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

fn watchdog_timeout() -> Duration {
    // Miri is dramatically slower for thread synchronization.
    if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    }
}

/// Runs a test on a separate thread and fails it if it does not finish in time.
///
/// Dataflow primitives block by design, so a bug usually shows up as a hang rather
/// than a wrong value. The watchdog turns such a hang into a test failure.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is
/// disabled and the test runs directly, so that mutation testing can detect hangs
/// with its own timeout.
///
/// # Panics
///
/// Panics if the test does not finish within the timeout, and resumes the panic of
/// the test itself if it panicked.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let value = with_watchdog(|| 2 + 2);
/// assert_eq!(value, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // The receiver is gone if the watchdog already gave up.
        drop(tx.send(test_fn()));
    });

    let timeout = watchdog_timeout();

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread.join().expect("test thread sent its result, so it did not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, it is probably deadlocked");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Polls `condition` until it holds, failing after the watchdog timeout.
///
/// For conditions that have no notification to wait on, such as "a writer is now
/// blocked on this channel".
///
/// # Panics
///
/// Panics if `condition` does not hold within the timeout.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now()
        .checked_add(watchdog_timeout())
        .expect("watchdog timeout fits in an Instant");

    while !condition() {
        assert!(Instant::now() < deadline, "condition did not become true in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// A thread-safe list that callbacks push values into and tests wait on.
///
/// Clones share the same list.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use testing::Collector;
///
/// let collector = Collector::new();
/// let writer = collector.clone();
/// thread::spawn(move || writer.push(7));
///
/// assert_eq!(collector.wait_for_len(1), vec![7]);
/// ```
#[derive(Debug)]
pub struct Collector<T> {
    shared: Arc<(Mutex<Vec<T>>, Condvar)>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Self {
            shared: Arc::new((Mutex::new(Vec::new()), Condvar::new())),
        }
    }
}

impl<T> Collector<T>
where
    T: Clone,
{
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` and wakes anyone waiting for the list to grow.
    pub fn push(&self, value: T) {
        let (values, grown) = &*self.shared;
        values.lock().push(value);
        grown.notify_all();
    }

    /// Blocks until at least `len` values have been pushed and returns them.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `len` values arrive within the watchdog timeout.
    #[must_use]
    pub fn wait_for_len(&self, len: usize) -> Vec<T> {
        let (values, grown) = &*self.shared;
        let deadline = Instant::now()
            .checked_add(watchdog_timeout())
            .expect("watchdog timeout fits in an Instant");

        let mut values = values.lock();
        while values.len() < len {
            assert!(
                !grown.wait_until(&mut values, deadline).timed_out() || values.len() >= len,
                "expected {len} values, only {} arrived in time",
                values.len()
            );
        }

        values.clone()
    }

    /// The values pushed so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.shared.0.lock().clone()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_returns_value() {
        assert_eq!(with_watchdog(|| "hello world"), "hello world");
    }

    #[test]
    #[should_panic]
    fn watchdog_resumes_test_panic() {
        with_watchdog(|| assert_eq!(1, 2, "inner failure"));
    }

    #[test]
    fn collector_waits_for_values() {
        let collector = Collector::new();

        let writer = collector.clone();
        let handle = thread::spawn(move || {
            for value in 0..3 {
                writer.push(value);
            }
        });

        assert_eq!(collector.wait_for_len(3), vec![0, 1, 2]);
        handle.join().unwrap();
        assert_eq!(collector.snapshot().len(), 3);
    }

    #[test]
    fn wait_until_returns_once_condition_holds() {
        let mut calls = 0_u32;

        wait_until(|| {
            calls = calls.wrapping_add(1);
            calls >= 3
        });

        assert_eq!(calls, 3);
    }
}
