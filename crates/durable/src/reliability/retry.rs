//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Classification of a failed step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; may succeed on a later attempt
    Retryable,

    /// Permanent; retrying cannot help
    Fatal,
}

/// Why a failed attempt will not be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The error was classified fatal
    NonRetryable,

    /// `max_attempts` reached
    AttemptsExhausted,
}

/// Outcome of applying a policy to a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the next attempt after this delay
    RetryAfter(Duration),

    /// Give up; the instance fails
    Fail(FailReason),
}

/// Invalid retry policy settings
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("backoff_coefficient must be >= 1.0, got {0}")]
    ShrinkingBackoff(f64),

    #[error("jitter must be within 0.0..=1.0, got {0}")]
    JitterOutOfRange(f64),

    #[error("initial_interval ({initial:?}) exceeds max_interval ({max:?})")]
    InitialAboveCap { initial: Duration, max: Duration },
}

/// Configuration for step retries
///
/// Supports exponential backoff with jitter to avoid thundering herd. Jitter
/// only ever shortens a delay, and never below the previous attempt's
/// nominal delay, so the schedule stays non-decreasing and within
/// `max_interval`.
///
/// # Example
///
/// ```
/// use stepwise_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means delays may be shortened by up to 10%.
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Check the policy can produce a bounded, non-decreasing schedule
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::NoAttempts);
        }
        if !(self.backoff_coefficient >= 1.0) {
            return Err(RetryPolicyError::ShrinkingBackoff(self.backoff_coefficient));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RetryPolicyError::JitterOutOfRange(self.jitter));
        }
        if self.initial_interval > self.max_interval {
            return Err(RetryPolicyError::InitialAboveCap {
                initial: self.initial_interval,
                max: self.max_interval,
            });
        }
        Ok(())
    }

    /// Nominal (un-jittered) delay before a given attempt number (1-based)
    ///
    /// Attempt 1 runs immediately; attempt `n > 1` waits
    /// `min(initial * coefficient^(n-2), max_interval)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let exponent = (retry_num - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        // NaN, negative, or past what a Duration can hold
        Duration::try_from_secs_f64(capped)
            .map(|delay| delay.min(self.max_interval))
            .unwrap_or(self.max_interval)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Default classifier: fatal if flagged fatal or listed as non-retryable
    pub fn classify(&self, class: ErrorClass, error_type: Option<&str>) -> ErrorClass {
        match class {
            ErrorClass::Retryable if self.should_retry(error_type) => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Decide what happens after `attempt` failed with `class`
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        self.decide_with(attempt, class, &mut rand::thread_rng())
    }

    /// Same as [`decide`](Self::decide) with an explicit random source
    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        class: ErrorClass,
        rng: &mut R,
    ) -> RetryDecision {
        if class == ErrorClass::Fatal {
            return RetryDecision::Fail(FailReason::NonRetryable);
        }
        if !self.has_attempts_remaining(attempt) {
            return RetryDecision::Fail(FailReason::AttemptsExhausted);
        }

        let next = attempt.saturating_add(1);
        let nominal = self.delay_for_attempt(next);
        if self.jitter <= 0.0 {
            return RetryDecision::RetryAfter(nominal);
        }

        // Lower bound never drops below the previous nominal delay
        let floor = self.delay_for_attempt(next - 1).as_secs_f64();
        let upper = nominal.as_secs_f64();
        let lower = (upper * (1.0 - self.jitter)).max(floor);

        let delay = if lower < upper {
            rng.gen_range(lower..=upper)
        } else {
            upper
        };
        let delay = Duration::try_from_secs_f64(delay).map_or(nominal, |d| d.min(nominal));
        RetryDecision::RetryAfter(delay)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
