//! Reliability primitives
//!
//! - [`RetryPolicy`] - Exponential backoff with jitter for failed steps

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{ErrorClass, FailReason, RetryDecision, RetryPolicy, RetryPolicyError};
