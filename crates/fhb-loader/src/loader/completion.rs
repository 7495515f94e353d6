//! Exactly-once job completion under concurrent record callbacks
//!
//! A job is done once its stream has been consumed and every record it
//! submitted has reported back. Both conditions fold into one counter of
//! outstanding work: the stream holds one unit from creation, each submitted
//! record adds one, and every completion takes one away. The caller that
//! takes the last unit is the one that finishes the job.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
pub struct CompletionTracker {
    outstanding: AtomicUsize,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    stream_done: AtomicBool,
    fired: AtomicBool,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(1),
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stream_done: AtomicBool::new(false),
            fired: AtomicBool::new(false),
        }
    }

    /// Count a record handed downstream
    ///
    /// Must happen before the record can possibly complete, and before the
    /// stream is reported complete.
    pub fn record_submitted(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A submitted record finished; true if this call completed the job
    pub fn operation_complete(&self, success: bool) -> bool {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.release()
    }

    /// The stream is exhausted; true if this call completed the job
    ///
    /// Repeated calls are ignored.
    pub fn stream_complete(&self) -> bool {
        if self.stream_done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.release()
    }

    fn release(&self) -> bool {
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => !self.fired.swap(true, Ordering::AcqRel),
            _ => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn is_stream_done(&self) -> bool {
        self.stream_done.load(Ordering::Acquire)
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Records still awaiting a downstream answer
    pub fn pending(&self) -> usize {
        let outstanding = self.outstanding.load(Ordering::Acquire);
        if self.is_stream_done() {
            outstanding
        } else {
            outstanding.saturating_sub(1)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_stream_completes_on_stream_end() {
        let tracker = CompletionTracker::new();
        assert!(!tracker.is_done());
        assert!(tracker.stream_complete());
        assert!(tracker.is_done());
        assert!(!tracker.stream_complete());
    }

    #[test]
    fn test_waits_for_both_conditions() {
        let tracker = CompletionTracker::new();
        tracker.record_submitted();
        tracker.record_submitted();

        assert!(!tracker.operation_complete(true));
        assert!(!tracker.stream_complete());
        assert_eq!(tracker.pending(), 1);
        assert!(tracker.operation_complete(false));

        assert_eq!(tracker.submitted(), 2);
        assert_eq!(tracker.succeeded(), 1);
        assert_eq!(tracker.failed(), 1);
    }

    #[test]
    fn test_records_finishing_after_stream() {
        let tracker = CompletionTracker::new();
        tracker.record_submitted();
        assert!(!tracker.stream_complete());
        assert!(tracker.operation_complete(true));
        assert!(tracker.is_done());
    }

    #[test]
    fn test_fires_once_across_threads() {
        for _ in 0..50 {
            let tracker = Arc::new(CompletionTracker::new());
            let records = 64;
            for _ in 0..records {
                tracker.record_submitted();
            }

            let mut handles = Vec::new();
            for i in 0..records {
                let tracker = tracker.clone();
                handles.push(std::thread::spawn(move || tracker.operation_complete(i % 3 != 0)));
            }
            let stream = {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.stream_complete())
            };

            let mut fired = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|f| *f)
                .count();
            if stream.join().unwrap() {
                fired += 1;
            }

            assert_eq!(fired, 1);
            assert_eq!(tracker.succeeded() + tracker.failed(), records as u64);
        }
    }
}
