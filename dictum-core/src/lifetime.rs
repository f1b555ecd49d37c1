//! Refresh lifetime and retry backoff policies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long a loaded snapshot (or cached entry) stays fresh.
///
/// The actual delay before the next refresh is drawn uniformly from
/// `[min, max]` so that dictionaries declared together do not refresh in
/// lockstep. A zero `max` means the data never expires on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    pub min: Duration,
    pub max: Duration,
}

impl Lifetime {
    pub const NEVER: Lifetime = Lifetime {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn fixed(period: Duration) -> Self {
        Self {
            min: period,
            max: period,
        }
    }

    pub fn range(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn is_never(&self) -> bool {
        self.max.is_zero()
    }

    /// Delay until the next scheduled refresh, or `None` for [`Lifetime::NEVER`].
    pub fn next_delay(&self) -> Option<Duration> {
        self.next_delay_with(&mut rand::rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Duration> {
        if self.is_never() {
            return None;
        }
        if self.min >= self.max {
            return Some(self.max);
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Some(Duration::from_millis(rng.random_range(min_ms..=max_ms)))
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::NEVER
    }
}

/// Backoff applied to failed refreshes.
///
/// Failed refreshes are retried indefinitely; only the spacing grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(600),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create RetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DICTUM_RETRY_INITIAL_BACKOFF_MS` (default: 5000)
    /// - `DICTUM_RETRY_MAX_BACKOFF_MS` (default: 600000)
    /// - `DICTUM_RETRY_BACKOFF_MULTIPLIER` (default: 2.0)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let initial_backoff = std::env::var("DICTUM_RETRY_INITIAL_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff);
        let max_backoff = std::env::var("DICTUM_RETRY_MAX_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff);
        let backoff_multiplier = std::env::var("DICTUM_RETRY_BACKOFF_MULTIPLIER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.backoff_multiplier);
        Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Un-jittered delay after `failed_attempts` consecutive failures:
    /// `min(initial * multiplier^(n-1), max)`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(63) as i32;
        let factor = f64::from(self.backoff_multiplier.max(1.0)).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff with jitter drawn from `[backoff / 2, backoff]`.
    pub fn jittered_backoff(&self, failed_attempts: u32) -> Duration {
        let full = self.backoff(failed_attempts).as_millis() as u64;
        if full == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(full / 2..=full))
    }
}
