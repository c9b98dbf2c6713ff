//! Counting semaphore with a microsecond timed wait.
//!
//! Used for reply correlation (capacity-1, drained before each request) and
//! completion signalling. The timed wait returns `false` on expiry so callers
//! decide whether to retry or surface a timeout.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Timeout sentinel: wait until signalled, however long that takes.
pub const WAIT_FOREVER_US: u64 = u64::MAX;

#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore::default()
    }

    /// Raise the semaphore, waking one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }

    /// Wait up to `timeout_us` microseconds for the semaphore.
    ///
    /// Zero polls without blocking; [`WAIT_FOREVER_US`] blocks indefinitely.
    /// Returns `true` if the semaphore was taken.
    pub fn wait_us(&self, timeout_us: u64) -> bool {
        let mut count = self.count.lock().unwrap();
        if timeout_us == WAIT_FOREVER_US {
            while *count == 0 {
                count = self.cv.wait(count).unwrap();
            }
        } else if *count == 0 && timeout_us > 0 {
            let (guard, _timed_out) = self
                .cv
                .wait_timeout_while(count, Duration::from_micros(timeout_us), |c| *c == 0)
                .unwrap();
            count = guard;
        }
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Take the semaphore if raised, without blocking.
    pub fn try_take(&self) -> bool {
        self.wait_us(0)
    }

    /// Consume any pending signals. Called before issuing a request so a
    /// stale signal from an earlier transaction cannot satisfy this one.
    pub fn drain(&self) {
        let mut count = self.count.lock().unwrap();
        *count = 0;
    }
}
