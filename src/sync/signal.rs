//! One-shot bounded-wait signal for splice handshakes

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot gate a thread can block on with a timeout.
///
/// Replaces manual-reset event handshakes: the state is checked under
/// the lock, so an `open` that races a `wait_for` is never lost.
pub struct ResetGate {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl ResetGate {
    /// Create a closed gate
    pub fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Open the gate, releasing every current and future waiter
    pub fn open(&self) {
        let mut opened = self.opened.lock();
        *opened = true;
        self.cond.notify_all();
    }

    /// Close the gate again so it can be waited on anew
    pub fn reset(&self) {
        *self.opened.lock() = false;
    }

    /// Check the gate without blocking
    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }

    /// Block until the gate opens or the timeout expires.
    ///
    /// Returns true if the gate was opened.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut opened = self.opened.lock();
        while !*opened {
            if self.cond.wait_until(&mut opened, deadline).timed_out() {
                return *opened;
            }
        }
        true
    }
}

impl Default for ResetGate {
    fn default() -> Self {
        Self::new()
    }
}
