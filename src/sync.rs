//! Counting semaphore used to pace the modem thread.
//!
//! The rings themselves are lock-free; blocking happens here, on the modem
//! side only. The realtime callback posts (a non-blocking notify) and never
//! waits. Every wait on the modem side carries a finite timeout.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore with timed waits.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with a zero count.
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Increments the count and wakes one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// Decrements the count, waiting up to `timeout` for it to become
    /// positive. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if result.timed_out() && *count == 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }

    /// Decrements the count if it is positive, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Removes all queued tokens, returning how many were discarded.
    ///
    /// Used when re-arming a rebuilt stream so stale posts from the previous
    /// incarnation cannot satisfy a fresh wait.
    pub fn drain(&self) -> usize {
        let mut count = self.count.lock().unwrap();
        std::mem::take(&mut *count)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
