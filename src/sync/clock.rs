//! Session clock - the single time base shared by all streams

use std::time::Instant;

/// Monotonic millisecond clock owned by the engine.
///
/// Every absolute timestamp in the system (write stamps, the epoch,
/// splice seam marks) is a reading of this one clock; presentation
/// times are rebased against it via each buffer's `time_zero`.
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    /// Create a clock with its origin at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock origin
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Milliseconds elapsed since an earlier reading of this clock
    pub fn elapsed_since(&self, earlier_ms: u64) -> u64 {
        self.now_ms().saturating_sub(earlier_ms)
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_monotonic() {
        let clock = SessionClock::new();
        let a = clock.now_ms();
        sleep(Duration::from_millis(10));
        let b = clock.now_ms();
        assert!(b >= a + 5, "clock went backwards: {} -> {}", a, b);
    }

    #[test]
    fn test_elapsed_since() {
        let clock = SessionClock::new();
        let t0 = clock.now_ms();
        sleep(Duration::from_millis(10));
        assert!(clock.elapsed_since(t0) >= 5);
        // readings from the future saturate to zero
        assert_eq!(clock.elapsed_since(u64::MAX), 0);
    }
}
