use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ceiling applied to computed delays unless a policy says otherwise.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Resubmit immediately.
    None,
    /// Wait `base_delay` before every retry.
    Linear,
    /// Wait `base_delay * 2^(attempt - 1)`.
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,
    /// Name of a registered delay override consulted for every retry.
    #[serde(default)]
    pub delay_override: Option<String>,
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_BACKOFF
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::None,
            base_delay: Duration::from_secs(0),
            max_delay: DEFAULT_MAX_BACKOFF,
            delay_override: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffKind, base_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            base_delay,
            ..Self::default()
        }
    }

    pub fn linear(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, BackoffKind::Linear, delay)
    }

    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self::new(max_retries, BackoffKind::Exponential, base_delay)
    }

    pub fn with_max_retries(mut self, value: u32) -> Self {
        self.max_retries = value;
        self
    }

    pub fn with_base_delay(mut self, value: Duration) -> Self {
        self.base_delay = value;
        self
    }

    pub fn with_max_delay(mut self, value: Duration) -> Self {
        self.max_delay = value;
        self
    }

    pub fn with_delay_override(mut self, id: impl Into<String>) -> Self {
        self.delay_override = Some(id.into());
        self
    }

    /// Whether a failed attempt `attempt` (1-based) may be followed by another.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::None => Duration::ZERO,
            BackoffKind::Linear => self.base_delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1);
                let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }
}
