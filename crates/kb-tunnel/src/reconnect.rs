//! Reconnect delays

use std::time::Duration;

use kb_core::config::BackoffConfig;

/// Delay schedule between reconnect attempts
///
/// With a multiplier of 1.0 and no jitter every delay equals the initial one,
/// which is how the client forwarder is configured by default.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay, restored by `reset`
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl Backoff {
    /// Create a backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// A constant delay
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0, 0.0)
    }

    /// Get the next delay and advance the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        if self.jitter == 0.0 {
            return delay;
        }
        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Go back to the initial delay after a healthy session
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
