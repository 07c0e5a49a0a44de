//! Per-sender timestamp source
//!
//! Wall-clock time can step backwards (NTP adjustments) and two sends can land on
//! the same tick. Envelopes from one sender must still carry non-decreasing
//! timestamps, so each stamp is clamped to the previous one.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    /// Current time, never earlier than any value previously returned
    pub fn now(&self) -> DateTime<Utc> {
        // A poisoned lock still holds a valid timestamp
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        let stamped = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(stamped);
        stamped
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequential_stamps_never_decrease() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_clamps_to_previous_stamp() {
        let clock = MonotonicClock::new();
        let future = Utc::now() + chrono::Duration::seconds(60);
        *clock.last.lock().unwrap() = Some(future);

        // Wall clock is behind the last stamp, so the stamp must not move back
        assert_eq!(clock.now(), future);
    }

    #[test]
    fn test_concurrent_stamps_are_ordered_per_thread() {
        let clock = Arc::new(MonotonicClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || {
                    let stamps: Vec<_> = (0..500).map(|_| clock.now()).collect();
                    stamps.windows(2).all(|w| w[0] <= w[1])
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
