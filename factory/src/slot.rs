//! The production slot handed down by the consensus layer.

use std::time::Duration;

use tokio::time::Instant;

/// A consensus scheduling window in which this node may emit one block.
#[derive(Clone, Debug)]
pub struct Slot {
    deadline: Instant,
    bp_timeout: Duration,
    /// Slot time in Unix nanoseconds, stamped into the produced block.
    timestamp_nanos: i64,
}

impl Slot {
    pub fn new(remaining: Duration, bp_timeout: Duration, timestamp_nanos: i64) -> Self {
        Self {
            deadline: Instant::now() + remaining,
            bp_timeout,
            timestamp_nanos,
        }
    }

    /// Milliseconds until the slot closes; 0 once it has passed.
    pub fn remaining_time_ms(&self) -> i64 {
        self.deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as i64
    }

    /// The per-block production deadline within the slot.
    pub fn bp_timeout(&self) -> Duration {
        self.bp_timeout
    }

    pub fn unix_nanos(&self) -> i64 {
        self.timestamp_nanos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_time_counts_down_to_zero() {
        let slot = Slot::new(Duration::from_millis(100), Duration::from_millis(20), 7);
        assert!(slot.remaining_time_ms() > 0);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(slot.remaining_time_ms(), 0);
    }

    #[test]
    fn accessors_expose_configuration() {
        let slot = Slot::new(Duration::from_secs(1), Duration::from_millis(50), 42);
        assert_eq!(slot.bp_timeout(), Duration::from_millis(50));
        assert_eq!(slot.unix_nanos(), 42);
    }
}
