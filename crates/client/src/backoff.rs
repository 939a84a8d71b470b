//! Reconnect backoff.
//!
//! After a drop the kernel asks the backoff how long to wait before the next
//! open attempt. The first attempt after a drop is immediate. After that the
//! delay grows exponentially from the initial value up to a cap:
//!
//! ```text
//! attempt 1: 0
//! attempt 2: initial
//! attempt n: min(initial * multiplier^(n-2), max_delay)
//! ```
//!
//! With the defaults (500 ms, x2.0, 5 s cap): 0, 500 ms, 1 s, 2 s, 4 s, 5 s, 5 s, ...
//!
//! The schedule is unlimited unless a maximum attempt count is set. The kernel
//! resets it once a socket has stayed open for the initial delay, so a node
//! that keeps accepting and dropping sockets walks the whole schedule.
//!
//! # Examples
//!
//! ```ignore
//! let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 2.0);
//! assert_eq!(backoff.next_sleep()?, Duration::ZERO);
//! assert_eq!(backoff.next_sleep()?, Duration::from_millis(500));
//! backoff.reset();
//! assert_eq!(backoff.next_sleep()?, Duration::ZERO);
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::config::ClientConfig;

/// Backoff budget exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// The configured number of reconnect attempts has been used up.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Exponential backoff controller owned by the connection kernel.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the second attempt after a drop.
    initial_delay: Duration,

    /// Delay handed out by the next non-immediate call.
    current_delay: Duration,

    /// Cap on any single delay.
    max_delay: Duration,

    /// Growth factor between consecutive delays.
    multiplier: f64,

    /// Attempts handed out since the last reset.
    attempt: u32,

    /// Hard limit on attempts per outage. `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Creates an unlimited backoff.
    ///
    /// A multiplier below 1.0 is treated as 1.0 (constant delay), and an
    /// initial delay above the cap is clamped to the cap.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.min(max);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Builds the reconnect backoff from the client settings.
    ///
    /// `max_reconnect_attempts = 0` means unlimited.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut backoff = Self::new(
            config.reconnect_delay(),
            config.reconnect_max_delay(),
            config.reconnect_backoff_multiplier,
        );
        if config.max_reconnect_attempts > 0 {
            backoff.set_max_attempts(config.max_reconnect_attempts);
        }
        backoff
    }

    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Starts the schedule over.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the wait before the next attempt and advances the schedule.
    ///
    /// Fails once the attempt limit, if any, has been reached.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
        }

        self.attempt += 1;
        if self.attempt == 1 {
            return Ok(Duration::ZERO);
        }

        let sleep = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next).min(self.max_delay);
        Ok(sleep)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    #[cfg(test)]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for Backoff {
    /// 500 ms initial delay, doubling, capped at 5 s, unlimited.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_is_immediate() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_sleep().unwrap(), Duration::ZERO);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_millis(500));
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn test_progression_is_capped() {
        let mut backoff = Backoff::default();
        let delays: Vec<u128> = (0..8)
            .map(|_| backoff.next_sleep().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![0, 500, 1000, 2000, 4000, 5000, 5000, 5000]);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::default();
        for _ in 0..4 {
            backoff.next_sleep().unwrap();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::ZERO);
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_max_attempts_exceeded() {
        let mut backoff = Backoff::default();
        backoff.set_max_attempts(2);

        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());
        assert_eq!(
            backoff.next_sleep(),
            Err(BackoffError::MaxAttemptLimitError(2))
        );
    }

    #[test]
    fn test_unlimited_by_default() {
        let mut backoff = Backoff::default();
        for _ in 0..1000 {
            assert!(backoff.next_sleep().is_ok());
        }
        assert_eq!(backoff.max_attempts(), None);
    }

    #[test]
    fn test_degenerate_parameters() {
        let mut flat = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.5);
        flat.next_sleep().unwrap();
        assert_eq!(flat.next_sleep().unwrap(), Duration::from_secs(1));
        assert_eq!(flat.next_sleep().unwrap(), Duration::from_secs(1));

        let mut clamped = Backoff::new(Duration::from_secs(30), Duration::from_secs(10), 2.0);
        clamped.next_sleep().unwrap();
        assert_eq!(clamped.next_sleep().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig {
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 100,
            reconnect_max_delay_ms: 400,
            ..ClientConfig::default()
        };
        let mut backoff = Backoff::from_config(&config);
        assert_eq!(backoff.max_attempts(), Some(3));
        assert_eq!(backoff.max_delay(), Duration::from_millis(400));
        backoff.next_sleep().unwrap();
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_millis(100));
    }
}
