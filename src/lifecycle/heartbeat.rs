use chrono::{DateTime, Utc};
use std::sync::Mutex;
use tokio::time::Instant;

use crate::sync::lock;
use crate::types::HealthVerdict;

#[derive(Debug, Clone, Default)]
pub struct HeartbeatRecord {
    /// `None` until the first signal after the last reset.
    pub last_seen: Option<Instant>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub received_count: u64,
}

/// Liveness bookkeeping for the guest. Signals are commutative, so the
/// tracker is last-writer-wins on the timestamp.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    record: Mutex<HeartbeatRecord>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_signal(&self) {
        let mut record = lock(&self.record);
        record.last_seen = Some(Instant::now());
        record.last_seen_at = Some(Utc::now());
        record.received_count += 1;
    }

    pub fn seconds_since_last_signal(&self) -> Option<f64> {
        let record = lock(&self.record);
        record
            .last_seen
            .map(|seen| Instant::now().duration_since(seen).as_secs_f64())
    }

    pub fn is_healthy(&self, timeout: f64) -> HealthVerdict {
        match self.seconds_since_last_signal() {
            None => HealthVerdict::NeverSignaled,
            Some(elapsed) if elapsed >= timeout => HealthVerdict::TimedOut,
            Some(_) => HealthVerdict::Healthy,
        }
    }

    /// Starts a fresh grace window. The lifetime counter is kept.
    pub fn reset(&self) {
        let mut record = lock(&self.record);
        record.last_seen = None;
        record.last_seen_at = None;
    }

    pub fn received_count(&self) -> u64 {
        lock(&self.record).received_count
    }

    pub fn snapshot(&self) -> HeartbeatRecord {
        lock(&self.record).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_signaled_is_distinct() {
        let tracker = HeartbeatTracker::new();
        assert_eq!(tracker.seconds_since_last_signal(), None);
        assert_eq!(tracker.is_healthy(10.0), HealthVerdict::NeverSignaled);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(tracker.is_healthy(10.0), HealthVerdict::NeverSignaled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_is_immediately_healthy() {
        let tracker = HeartbeatTracker::new();
        tracker.record_signal();

        let elapsed = tracker.seconds_since_last_signal().unwrap();
        assert!(elapsed < 0.01);
        assert_eq!(tracker.is_healthy(10.0), HealthVerdict::Healthy);
        assert_eq!(tracker.received_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_threshold() {
        let tracker = HeartbeatTracker::new();
        tracker.record_signal();

        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert_eq!(tracker.is_healthy(10.0), HealthVerdict::Healthy);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(tracker.is_healthy(10.0), HealthVerdict::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_keeps_counter() {
        let tracker = HeartbeatTracker::new();
        tracker.record_signal();
        tracker.record_signal();
        tracker.reset();

        assert_eq!(tracker.is_healthy(10.0), HealthVerdict::NeverSignaled);
        assert_eq!(tracker.received_count(), 2);
        assert!(tracker.snapshot().last_seen_at.is_none());
    }
}
