//! Run-level failure state machine.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// What a recorded failure did to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First failure: the caller must cancel the queue and run cleanup.
    Tripped,
    /// Already cancelling; the failure is counted but nothing else happens.
    AlreadyCancelling,
}

/// Tracks whether a run is still healthy.
///
/// `Running -> Cancelling` happens exactly once, on the first failure. The
/// transition is one-way: later failures only bump the counter.
#[derive(Debug, Default)]
pub struct FailureMonitor {
    cancelling: AtomicBool,
    failures: AtomicUsize,
}

impl FailureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self) -> Transition {
        self.failures.fetch_add(1, Ordering::SeqCst);
        if self.cancelling.swap(true, Ordering::SeqCst) {
            Transition::AlreadyCancelling
        } else {
            Transition::Tripped
        }
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn starts_running() {
        let monitor = FailureMonitor::new();
        assert!(!monitor.is_cancelling());
        assert_eq!(monitor.failures(), 0);
    }

    #[test]
    fn first_failure_trips_once() {
        let monitor = FailureMonitor::new();
        assert_eq!(monitor.record_failure(), Transition::Tripped);
        assert_eq!(monitor.record_failure(), Transition::AlreadyCancelling);
        assert!(monitor.is_cancelling());
        assert_eq!(monitor.failures(), 2);
    }

    #[test]
    fn concurrent_failures_trip_exactly_once() {
        let monitor = Arc::new(FailureMonitor::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let monitor = Arc::clone(&monitor);
                thread::spawn(move || monitor.record_failure())
            })
            .collect();
        let tripped = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .filter(|t| *t == Transition::Tripped)
            .count();
        assert_eq!(tripped, 1);
        assert_eq!(monitor.failures(), 16);
    }
}
