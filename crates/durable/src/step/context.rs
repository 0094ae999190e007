//! Step execution context

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::payload::Payload;

/// Context provided to steps during execution
///
/// The context provides:
/// - Information about the current attempt
/// - The workflow input and the outputs of steps that already succeeded
/// - Lease-loss detection
///
/// Losing the lease means another dispatcher may pick the instance up, so a
/// long-running step should stop at its next safe point. Whatever the step
/// returns afterwards is recorded but cannot advance the instance.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &StepContext, input: Payload) -> Result<Payload, StepError> {
///     for batch in batches(&input)? {
///         if ctx.is_lease_lost() {
///             return Err(StepError::retryable("lease lost"));
///         }
///         upload(batch, ctx.idempotency_key()).await?;
///     }
///     Ok(Payload::null())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Instance being advanced
    pub instance_id: Uuid,

    /// Workflow type of the instance
    pub workflow_type: String,

    /// Run generation of the instance
    pub run: u32,

    /// Step name within the workflow
    pub step_name: String,

    /// Position of the step (0-based)
    pub step_index: u32,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    workflow_input: Payload,
    completed: Arc<Vec<(String, Payload)>>,
    lease_lost: watch::Receiver<bool>,
}

impl StepContext {
    /// Create a step context
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: Uuid,
        workflow_type: impl Into<String>,
        run: u32,
        step_name: impl Into<String>,
        step_index: u32,
        attempt: u32,
        max_attempts: u32,
        workflow_input: Payload,
    ) -> Self {
        let (_, lease_lost) = watch::channel(false);
        Self {
            instance_id,
            workflow_type: workflow_type.into(),
            run,
            step_name: step_name.into(),
            step_index,
            attempt,
            max_attempts,
            workflow_input,
            completed: Arc::new(Vec::new()),
            lease_lost,
        }
    }

    /// Attach the outputs of previously succeeded steps, in order
    pub fn with_completed(mut self, completed: Vec<(String, Payload)>) -> Self {
        self.completed = Arc::new(completed);
        self
    }

    /// Attach a lease-loss signal
    pub fn with_lease_signal(mut self, signal: &LeaseSignal) -> Self {
        self.lease_lost = signal.subscribe();
        self
    }

    /// Input the instance was started with
    pub fn workflow_input(&self) -> &Payload {
        &self.workflow_input
    }

    /// Output of an earlier step by name
    pub fn output_of(&self, step_name: &str) -> Option<&Payload> {
        self.completed
            .iter()
            .find(|(name, _)| name == step_name)
            .map(|(_, output)| output)
    }

    /// Stable key for deduplicating external side effects across attempts
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.instance_id, self.run, self.step_index)
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Check if the instance lease was lost
    pub fn is_lease_lost(&self) -> bool {
        *self.lease_lost.borrow()
    }

    /// Resolves once the lease is lost
    ///
    /// This is useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.lease_lost() => {
    ///         return Err(StepError::retryable("lease lost"));
    ///     }
    /// }
    /// ```
    pub async fn lease_lost(&self) {
        let mut rx = self.lease_lost.clone();
        // A dropped sender means nobody can report loss; wait forever
        if rx.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sender side of the lease-loss flag
#[derive(Debug, Clone)]
pub struct LeaseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl LeaseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the lease as lost
    pub fn mark_lost(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_lost(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for LeaseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn context(attempt: u32) -> StepContext {
        StepContext::new(
            Uuid::now_v7(),
            "ship-order",
            1,
            "charge",
            1,
            attempt,
            3,
            Payload::new(json!({"order_id": "A-1"})),
        )
    }

    #[test]
    fn test_step_context_creation() {
        let ctx = context(1);

        assert_eq!(ctx.step_name, "charge");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert_eq!(ctx.workflow_input().as_value()["order_id"], "A-1");
        assert!(!ctx.is_lease_lost());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        assert!(context(3).is_last_attempt());
        assert!(!context(2).is_last_attempt());
    }

    #[test]
    fn test_output_of_completed_step() {
        let ctx = context(1).with_completed(vec![(
            "reserveInventory".to_string(),
            Payload::new(json!({"reservation": "R-9"})),
        )]);

        assert_eq!(
            ctx.output_of("reserveInventory").unwrap().as_value()["reservation"],
            "R-9"
        );
        assert!(ctx.output_of("notify").is_none());
    }

    #[test]
    fn test_idempotency_key_is_stable_across_attempts() {
        let first = context(1);
        let mut second = first.clone();
        second.attempt = 2;

        assert_eq!(first.idempotency_key(), second.idempotency_key());
    }

    #[test]
    fn test_lease_signal() {
        let signal = LeaseSignal::new();
        let ctx = context(1).with_lease_signal(&signal);

        assert!(!ctx.is_lease_lost());
        signal.mark_lost();
        assert!(ctx.is_lease_lost());
        assert!(signal.is_lost());
    }

    #[tokio::test]
    async fn test_lease_lost_future_resolves() {
        let signal = LeaseSignal::new();
        let ctx = context(1).with_lease_signal(&signal);

        let waiter = tokio::spawn(async move { ctx.lease_lost().await });
        signal.mark_lost();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("lease_lost should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_earlier_loss() {
        let signal = LeaseSignal::new();
        signal.mark_lost();

        // The flag is level-triggered, so a context built afterwards still sees it
        let ctx = context(2).with_lease_signal(&signal);
        assert!(ctx.is_lease_lost());
        tokio::time::timeout(Duration::from_millis(100), ctx.lease_lost())
            .await
            .expect("lease_lost resolves for a loss reported earlier");
    }
}
