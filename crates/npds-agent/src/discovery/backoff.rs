//! Reconnect backoff: exponential growth with jitter, capped.
//!
//! Each delay is the current base scaled by a random factor in `[0.5, 1.5)`
//! so that agents reconnecting after a control-plane restart spread out.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffSection;

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl From<&BackoffSection> for BackoffConfig {
    fn from(s: &BackoffSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(s.initial_ms),
            max_delay: Duration::from_millis(s.max_ms),
            multiplier: s.multiplier,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Jittered delay for this attempt; advances the base for the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier).min(self.config.max_delay.as_secs_f64()),
        );
        delay
    }

    /// Back to the initial delay (after a stream made progress).
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempt = 0;
    }
}
