//! Step trait definition

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StepContext;
use crate::payload::{ErrorInfo, Payload, PayloadError};
use crate::reliability::ErrorClass;

/// Error type for step failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    ///
    /// Matched against the retry policy's `non_retryable_errors`.
    pub error_type: Option<String>,

    /// Whether this error may succeed on retry
    pub class: ErrorClass,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            class: ErrorClass::Retryable,
            details: None,
        }
    }

    /// Create a fatal error; the instance fails without further attempts
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            class: ErrorClass::Fatal,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }

    /// Durable form of this error as classified by the retry policy
    pub fn to_error_info(&self, class: ErrorClass, step_name: &str, attempt: u32) -> ErrorInfo {
        ErrorInfo {
            message: self.message.clone(),
            error_type: self.error_type.clone(),
            retryable: class == ErrorClass::Retryable,
            step_name: Some(step_name.to_string()),
            attempt: Some(attempt),
            details: self.details.clone(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Malformed input will not improve on retry
impl From<PayloadError> for StepError {
    fn from(err: PayloadError) -> Self {
        Self::fatal(err.to_string()).with_type("PAYLOAD")
    }
}

/// A step is one unit of business logic in a workflow
///
/// Steps run strictly in order, each at most once per attempt, and are
/// retried according to the workflow's retry policy. Because a crash between
/// the side effect and the durable record re-runs the attempt, steps with
/// external side effects should deduplicate on
/// [`StepContext::idempotency_key`].
///
/// # Example
///
/// ```ignore
/// use stepwise_durable::prelude::*;
///
/// struct ChargeCard {
///     payments: PaymentsClient,
/// }
///
/// #[async_trait]
/// impl Step for ChargeCard {
///     async fn execute(&self, ctx: &StepContext, input: Payload) -> Result<Payload, StepError> {
///         let order: Order = input.decode()?;
///         let receipt = self
///             .payments
///             .charge(&order, &ctx.idempotency_key())
///             .await
///             .map_err(|e| StepError::retryable(e.to_string()))?;
///         Ok(Payload::encode(&receipt)?)
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Execute the step
    ///
    /// # Errors
    ///
    /// Return `StepError::retryable()` for transient failures that should be retried.
    /// Return `StepError::fatal()` for permanent failures.
    async fn execute(&self, ctx: &StepContext, input: Payload) -> Result<Payload, StepError>;
}

/// Step backed by a closure, see [`step_fn`]
pub struct FnStep<F> {
    f: F,
}

/// Adapt an async closure into a [`Step`]
///
/// ```
/// use stepwise_durable::{step_fn, Payload, StepError};
///
/// let notify = step_fn(|ctx, input: Payload| async move {
///     let _ = (ctx.instance_id, input);
///     Ok::<_, StepError>(Payload::null())
/// });
/// # let _ = notify;
/// ```
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, StepError>> + Send + 'static,
{
    FnStep { f }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: &StepContext, input: Payload) -> Result<Payload, StepError> {
        (self.f)(ctx.clone(), input).await
    }
}
