//! Monotonic write-sequence numbers
//!
//! Sequences are hybrid: wall-clock microseconds when the clock is ahead of
//! the last issued value, otherwise the last value plus one. This keeps them
//! roughly comparable across processes while staying strictly increasing
//! inside one.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

#[derive(Debug, Default)]
pub struct SequenceClock {
    last: AtomicU64,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next sequence number
    pub fn next(&self) -> u64 {
        let now = now_micros();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(current.saturating_add(1));
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Make sure later sequences sort after one seen elsewhere
    pub fn observe(&self, sequence: u64) {
        self.last.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Most recently issued or observed sequence
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_strictly_increases() {
        let clock = SequenceClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_observe_moves_clock_forward() {
        let clock = SequenceClock::new();
        let far_future = clock.next() + 10_000_000_000;
        clock.observe(far_future);
        assert_eq!(clock.last(), far_future);
        assert_eq!(clock.next(), far_future + 1);

        // observing an older value is a no-op
        clock.observe(5);
        assert_eq!(clock.last(), far_future + 1);
    }

    #[test]
    fn test_sequences_unique_across_threads() {
        let clock = Arc::new(SequenceClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..500).map(|_| clock.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seq in handle.join().expect("thread panicked") {
                assert!(seen.insert(seq), "duplicate sequence {seq}");
            }
        }
        assert_eq!(seen.len(), 2000);
    }
}
