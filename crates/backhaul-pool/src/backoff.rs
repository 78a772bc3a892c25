//! Linear backoff pacing agent creation.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Backoff tuning for the pool supervisor.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Added per attempt.
    pub step: Duration,
    /// Ceiling for the computed delay.
    pub max: Duration,
    /// Randomize each delay within `[d/2, d]`.
    pub jitter: bool,
    /// Reset after `max * auto_reset_factor` of quiet. Zero disables.
    pub auto_reset_factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max: Duration::from_secs(8),
            jitter: true,
            auto_reset_factor: 4,
        }
    }
}

/// Linear, capped, jittered backoff.
///
/// The supervisor advances it once per loop iteration regardless of outcome;
/// a long enough quiet period resets it so a healthy pool reconnects fast.
pub(crate) struct LinearBackoff {
    config: BackoffConfig,
    attempts: u32,
    last_inc: Option<Instant>,
}

impl LinearBackoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_inc: None,
        }
    }

    /// Advances the backoff, first resetting it when the auto-reset window
    /// has elapsed since the previous advance.
    pub(crate) fn inc(&mut self) {
        let now = Instant::now();
        if let (Some(last), factor) = (self.last_inc, self.config.auto_reset_factor) {
            if factor > 0 && now.duration_since(last) > self.config.max * factor {
                self.attempts = 0;
            }
        }
        self.attempts = self.attempts.saturating_add(1);
        self.last_inc = Some(now);
    }

    /// Current delay; zero before the first advance.
    pub(crate) fn delay(&self) -> Duration {
        let base = (self.config.step * self.attempts).min(self.config.max);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let millis = base.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }
}
