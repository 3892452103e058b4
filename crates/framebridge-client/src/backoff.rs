use std::time::Duration;

/// Reconnect delays, in order; the last tier repeats.
pub const DEFAULT_BACKOFF: [Duration; 4] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// Tiered reconnect backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Vec<Duration>,
    index: usize,
}

impl Backoff {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule, index: 0 }
    }

    /// Delay before the next attempt; advances toward the last tier.
    pub fn next_delay(&mut self) -> Duration {
        let Some(last) = self.schedule.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let delay = self.schedule[self.index.min(last)];
        self.index = (self.index + 1).min(last);
        delay
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF.to_vec())
    }
}
