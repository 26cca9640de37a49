//! Exponential backoff for retrying local accepts

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Exponential backoff without an attempt limit
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current backoff, then grow it
    pub async fn wait(&mut self) {
        self.attempt += 1;
        debug!(
            "Waiting {}ms before retry {}",
            self.current_backoff.as_millis(),
            self.attempt
        );

        sleep(self.current_backoff).await;

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);
    }

    /// Reset backoff (call after a successful accept)
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
