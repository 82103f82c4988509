use std::time::Duration;

/// Exponential reconnect delay.
///
/// Delays grow as `min * 2^attempt`, capped at `max`. With jitter enabled the
/// returned delay is drawn uniformly from the upper half of that value so
/// that clients dropped together do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let delay = self.min.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        if self.jitter {
            let half = delay / 2;
            half + half.mul_f64(rand::random::<f64>())
        } else {
            delay
        }
    }

    /// Back to the minimum delay, called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), true)
    }
}
