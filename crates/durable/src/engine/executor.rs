//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - The host API: start, status, cancel, wake, signal, re-run and history
//! - Running a claimed instance forward one turn: replay the step history,
//!   execute the next step (or check on a wait), record the outcome, and
//!   decide the next state

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{self, ConfigError};
use crate::payload::{ErrorInfo, Payload};
use crate::persistence::{
    to_time_delta, CancelOutcome, ClaimedInstance, InstanceRecord, InstanceState, InstanceUpdate,
    NewInstance, SignalDelivery, StepRecord, StepStatus, StoreError, WorkflowStore,
};
use crate::reliability::{ErrorClass, FailReason, RetryDecision, RetryPolicy};
use crate::step::{Step, StepContext, StepError};
use crate::worker::LeaseHandle;

use super::registry::{StepKind, WorkflowDefinition, WorkflowRegistry};
use super::replay::{latest_attempt, replay, NextAction, ReplayError};
use super::status::InstanceStatus;

/// Configuration for the workflow executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Steps run back to back in one turn before yielding the lease
    pub max_steps_per_turn: u32,

    /// Re-read-and-retry rounds after a lost compare-and-swap
    pub max_conflict_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps_per_turn: 100,
            max_conflict_retries: 3,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_steps_per_turn(mut self, steps: u32) -> Self {
        self.max_steps_per_turn = steps.max(1);
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Read `STEPWISE_MAX_STEPS_PER_TURN` and `STEPWISE_MAX_CONFLICT_RETRIES`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(config::process_env)
    }

    pub(crate) fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_steps_per_turn: config::var_or(
                &lookup,
                "STEPWISE_MAX_STEPS_PER_TURN",
                defaults.max_steps_per_turn,
            )?,
            max_conflict_retries: config::var_or(
                &lookup,
                "STEPWISE_MAX_CONFLICT_RETRIES",
                defaults.max_conflict_retries,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps_per_turn == 0 {
            return Err(ConfigError::Invalid(
                "max_steps_per_turn must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Unknown workflow type; nothing was created
    #[error("no workflow definition registered for type: {0}")]
    DefinitionNotFound(String),

    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Caller-supplied id already in use
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(Uuid),

    /// Operation needs a live instance
    #[error("instance {instance_id} is already {state}")]
    AlreadyTerminal {
        instance_id: Uuid,
        state: InstanceState,
    },

    /// Re-run needs a finished instance
    #[error("instance {instance_id} is {state}, not terminal")]
    NotTerminal {
        instance_id: Uuid,
        state: InstanceState,
    },

    /// Re-run from failure needs a FAILED instance
    #[error("instance {instance_id} is {state}, not failed")]
    NotFailed {
        instance_id: Uuid,
        state: InstanceState,
    },

    /// Kept losing compare-and-swap races
    #[error("instance {0} kept changing concurrently")]
    Contended(Uuid),

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InstanceNotFound(id) => Self::InstanceNotFound(id),
            StoreError::InstanceAlreadyExists(id) => Self::InstanceAlreadyExists(id),
            other => Self::Store(other),
        }
    }
}

impl ExecutorError {
    /// Infrastructure failure worth retrying later
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_unavailable())
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Every step succeeded
    Completed,

    /// A step failed retryably, or a sleep or condition is pending; due again at `wake_at`
    Waiting { wake_at: DateTime<Utc> },

    /// Parked until `signal` is delivered, or until `deadline` if there is one
    AwaitingSignal {
        signal: String,
        deadline: Option<DateTime<Utc>>,
    },

    /// A step failed fatally or ran out of attempts
    Failed,

    /// Step budget for the turn used up; due again immediately
    Yielded,

    /// Someone else changed the instance (e.g. cancellation); results ignored
    Superseded { state: InstanceState },

    /// The lease expired or was taken over; results ignored
    LeaseLost,
}

/// Outcome of a conditional write under the lease
enum Commit {
    Applied(InstanceRecord),
    Superseded(InstanceState),
    LeaseLost,
}

/// Outcome of appending an attempt row
enum Recorded {
    Appended,
    /// Another writer got there first but the lease is still ours; history reloaded
    AlreadyRecorded,
    /// The lease is gone; stop the turn
    Dropped(TurnOutcome),
}

/// The step a turn is about to take
struct Position<'a> {
    instance: &'a InstanceRecord,
    name: &'a str,
    step_index: u32,
    attempt: u32,
    input: Payload,
    completed: Vec<(String, Payload)>,
    policy: &'a RetryPolicy,
}

impl Position<'_> {
    fn context(&self, lease: &LeaseHandle) -> StepContext {
        StepContext::new(
            self.instance.id,
            self.instance.workflow_type.clone(),
            self.instance.run,
            self.name,
            self.step_index,
            self.attempt,
            self.policy.max_attempts,
            self.instance.input.clone(),
        )
        .with_completed(self.completed.clone())
        .with_lease_signal(lease.signal())
    }

    fn record(
        &self,
        lease: &LeaseHandle,
        status: StepStatus,
        scheduled_at: DateTime<Utc>,
    ) -> StepRecord {
        StepRecord {
            instance_id: self.instance.id,
            run: self.instance.run,
            step_index: self.step_index,
            step_name: self.name.to_string(),
            attempt: self.attempt,
            status,
            input: self.input.clone(),
            output: None,
            error: None,
            worker_id: Some(lease.owner().to_string()),
            scheduled_at,
            completed_at: None,
            retry_at: None,
        }
    }

    /// When a wait that began at `since` gives up
    fn deadline(
        &self,
        since: DateTime<Utc>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        timeout
            .map(|timeout| to_time_delta(timeout).map(|delta| since + delta))
            .transpose()
    }
}

/// Workflow executor
///
/// The executor drives instances through their steps by replaying the
/// recorded step history. It never holds locks across steps; mutual
/// exclusion comes from the lease and the `version` compare-and-swap.
///
/// # Example
///
/// ```ignore
/// use stepwise_durable::prelude::*;
///
/// let mut registry = WorkflowRegistry::new();
/// registry.register(ship_order())?;
///
/// let executor = WorkflowExecutor::new(
///     Arc::new(InMemoryWorkflowStore::new()),
///     Arc::new(registry),
///     Arc::new(SystemClock),
/// );
///
/// let id = executor.start("ship-order", Payload::encode(&order)?).await?;
/// let status = executor.get_status(id).await?;
/// ```
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<WorkflowRegistry>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create a new executor
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_config(store, registry, clock, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<WorkflowRegistry>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // =========================================================================
    // Host API
    // =========================================================================

    /// Start a workflow with a generated id
    pub async fn start(&self, workflow_type: &str, input: Payload) -> Result<Uuid, ExecutorError> {
        self.start_with_id(Uuid::now_v7(), workflow_type, input)
            .await
    }

    /// Start a workflow with a caller-supplied id
    ///
    /// Unknown workflow types are rejected before anything is persisted.
    #[instrument(skip(self, input))]
    pub async fn start_with_id(
        &self,
        instance_id: Uuid,
        workflow_type: &str,
        input: Payload,
    ) -> Result<Uuid, ExecutorError> {
        if !self.registry.contains(workflow_type) {
            return Err(ExecutorError::DefinitionNotFound(workflow_type.to_string()));
        }

        self.store
            .create_instance(
                NewInstance {
                    id: instance_id,
                    workflow_type: workflow_type.to_string(),
                    input,
                },
                self.clock.now(),
            )
            .await?;

        info!(%instance_id, workflow_type, "Started workflow");
        Ok(instance_id)
    }

    /// Current state, step, and result or error
    pub async fn get_status(&self, instance_id: Uuid) -> Result<InstanceStatus, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        let history = self.store.load_steps(instance_id).await?;
        let definition = self.registry.get(&instance.workflow_type);

        Ok(InstanceStatus::derive(
            instance,
            &history,
            definition.as_deref(),
            self.clock.now(),
        ))
    }

    /// Full step history, all runs
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, ExecutorError> {
        Ok(self.store.load_steps(instance_id).await?)
    }

    /// Request cancellation
    ///
    /// Returns `false` if the instance was already terminal. A step that is
    /// in flight finishes and is recorded, but nothing further is scheduled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: Uuid) -> Result<bool, ExecutorError> {
        match self
            .store
            .cancel_instance(instance_id, self.clock.now())
            .await?
        {
            CancelOutcome::Cancelled { .. } => {
                info!(%instance_id, "Cancelled workflow");
                Ok(true)
            }
            CancelOutcome::AlreadyTerminal(state) => {
                debug!(%instance_id, %state, "Cancel ignored, instance already terminal");
                Ok(false)
            }
        }
    }

    /// Make a WAITING instance due now instead of at its backoff deadline
    ///
    /// Returns `false` if the instance was not waiting.
    #[instrument(skip(self))]
    pub async fn wake(&self, instance_id: Uuid) -> Result<bool, ExecutorError> {
        for _ in 0..=self.config.max_conflict_retries {
            let instance = self.store.get_instance(instance_id).await?;
            if instance.state.is_terminal() {
                return Err(ExecutorError::AlreadyTerminal {
                    instance_id,
                    state: instance.state,
                });
            }
            if instance.state != InstanceState::Waiting {
                return Ok(false);
            }

            let now = self.clock.now();
            match self
                .store
                .update_instance(instance_id, instance.version, InstanceUpdate::waiting(now), now)
                .await
            {
                Ok(_) => {
                    debug!(%instance_id, "Woke waiting instance");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(ExecutorError::Contended(instance_id))
    }

    /// Deliver a named signal carrying `payload`
    ///
    /// Signals belong to the current run and are kept until a wait step asks
    /// for them, so they may arrive before the instance starts waiting.
    /// Returns `false` if this run already received a signal with that name.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Payload,
    ) -> Result<bool, ExecutorError> {
        match self
            .store
            .deliver_signal(instance_id, name, payload, self.clock.now())
            .await?
        {
            SignalDelivery::Delivered { run, woke } => {
                info!(%instance_id, signal = name, run, woke, "Delivered signal");
                Ok(true)
            }
            SignalDelivery::AlreadyDelivered => {
                debug!(%instance_id, signal = name, "Signal already delivered to this run");
                Ok(false)
            }
            SignalDelivery::AlreadyTerminal(state) => {
                Err(ExecutorError::AlreadyTerminal { instance_id, state })
            }
        }
    }

    /// Run a finished instance again from its first step under a new run
    ///
    /// Returns the new run number. Earlier runs' history is kept.
    #[instrument(skip(self))]
    pub async fn rerun_from_start(&self, instance_id: Uuid) -> Result<u32, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        self.require_definition(&instance.workflow_type)?;
        if !instance.state.is_terminal() {
            return Err(ExecutorError::NotTerminal {
                instance_id,
                state: instance.state,
            });
        }

        self.reopen(instance, Vec::new()).await
    }

    /// Run a FAILED instance again from the step that failed
    ///
    /// The previous run's succeeded steps are carried into the new run so
    /// they are not executed again.
    #[instrument(skip(self))]
    pub async fn rerun_from_failed(&self, instance_id: Uuid) -> Result<u32, ExecutorError> {
        let instance = self.store.get_instance(instance_id).await?;
        self.require_definition(&instance.workflow_type)?;
        if instance.state != InstanceState::Failed {
            return Err(ExecutorError::NotFailed {
                instance_id,
                state: instance.state,
            });
        }

        let carried = self
            .store
            .load_steps(instance_id)
            .await?
            .into_iter()
            .filter(|r| r.run == instance.run && r.status == StepStatus::Succeeded)
            .collect();

        self.reopen(instance, carried).await
    }

    fn require_definition(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, ExecutorError> {
        self.registry
            .get(workflow_type)
            .ok_or_else(|| ExecutorError::DefinitionNotFound(workflow_type.to_string()))
    }

    /// Bump the run and carry rows over in one store write
    async fn reopen(
        &self,
        instance: InstanceRecord,
        carried: Vec<StepRecord>,
    ) -> Result<u32, ExecutorError> {
        let now = self.clock.now();
        match self
            .store
            .reopen_instance(instance.id, instance.version, carried, now)
            .await
        {
            Ok(reopened) => {
                info!(instance_id = %instance.id, run = reopened.run, "Re-running workflow");
                Ok(reopened.run)
            }
            Err(StoreError::InvalidTransition { from, .. }) => Err(ExecutorError::NotTerminal {
                instance_id: instance.id,
                state: from,
            }),
            Err(e) if e.is_conflict() => Err(ExecutorError::Contended(instance.id)),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Worker API
    // =========================================================================

    /// Advance a claimed instance as far as one turn allows
    ///
    /// Steps run back to back while the lease is held. The turn ends when
    /// the instance completes, fails, waits for a retry, uses up
    /// `max_steps_per_turn`, or turns out to have been changed by someone
    /// else. Only infrastructure failures are returned as errors; business
    /// failures are recorded on the instance.
    #[instrument(skip(self, claim, lease), fields(instance_id = %claim.instance.id, workflow_type = %claim.instance.workflow_type))]
    pub async fn run_turn(
        &self,
        claim: &ClaimedInstance,
        lease: &LeaseHandle,
    ) -> Result<TurnOutcome, ExecutorError> {
        let instance = &claim.instance;
        if claim.was_orphaned() {
            info!("Resuming instance after expired lease");
        }

        let Some(definition) = self.registry.get(&instance.workflow_type) else {
            error!("No definition registered, failing instance");
            let info = ErrorInfo::new(format!(
                "no workflow definition registered for type: {}",
                instance.workflow_type
            ))
            .with_type("DEFINITION_NOT_FOUND");
            return self.finish(lease, InstanceUpdate::failed(info), TurnOutcome::Failed).await;
        };

        let mut history = self.store.load_steps(instance.id).await?;

        for executed in 0..self.config.max_steps_per_turn {
            if executed > 0 || lease.is_lost() {
                if let Some(outcome) = self.check_still_owned(lease).await? {
                    return Ok(outcome);
                }
            }

            if let Some(outcome) = self
                .advance(claim, &definition, lease, &mut history)
                .await?
            {
                return Ok(outcome);
            }
        }

        debug!(
            max_steps = self.config.max_steps_per_turn,
            "Step budget used, yielding"
        );
        let now = self.clock.now();
        self.finish(lease, InstanceUpdate::yielded(now), TurnOutcome::Yielded)
            .await
    }

    /// Take one step: `None` to keep going, otherwise how the turn ended
    async fn advance(
        &self,
        claim: &ClaimedInstance,
        definition: &WorkflowDefinition,
        lease: &LeaseHandle,
        history: &mut Vec<StepRecord>,
    ) -> Result<Option<TurnOutcome>, ExecutorError> {
        let instance = &claim.instance;
        let replayed = match replay(definition, &instance.input, history, instance.run) {
            Ok(replayed) => replayed,
            Err(e) => return self.fail_nondeterministic(lease, e).await.map(Some),
        };

        let (step_index, attempt, input) = match replayed.next {
            NextAction::Complete { result } => {
                return self
                    .finish(lease, InstanceUpdate::completed(result), TurnOutcome::Completed)
                    .await
                    .map(Some);
            }
            NextAction::Execute {
                step_index,
                attempt,
                input,
            } => (step_index, attempt, input),
        };

        let Some(spec) = definition.step(step_index) else {
            let err = ReplayError::UnknownStep {
                step_index,
                defined: definition.len(),
            };
            return self.fail_nondeterministic(lease, err).await.map(Some);
        };

        // A retryable failure was recorded but the instance never parked, so
        // the backoff is still owed. A WAITING instance was parked or woken on purpose.
        let now = self.clock.now();
        let backoff = latest_attempt(history, instance.run, step_index)
            .filter(|_| claim.previous_state != InstanceState::Waiting)
            .filter(|row| row.status == StepStatus::FailedRetryable)
            .and_then(|row| row.retry_at)
            .filter(|retry_at| *retry_at > now);
        if let Some(wake_at) = backoff {
            debug!(step = spec.name(), %wake_at, "Retry backoff not over, parking again");
            return self
                .finish(
                    lease,
                    InstanceUpdate::waiting(wake_at),
                    TurnOutcome::Waiting { wake_at },
                )
                .await
                .map(Some);
        }

        let mut at = Position {
            instance,
            name: spec.name(),
            step_index,
            attempt,
            input,
            completed: replayed.completed,
            policy: definition.retry_policy_for(step_index),
        };

        let since = if spec.kind().is_wait() {
            let started = history
                .iter()
                .find(|r| {
                    r.run == instance.run
                        && r.step_index == step_index
                        && r.status == StepStatus::Waiting
                })
                .map(|r| r.scheduled_at);
            match started {
                Some(since) => since,
                None => {
                    let row = at.record(lease, StepStatus::Waiting, now);
                    match self.record_attempt(lease, row, history).await? {
                        Recorded::Appended => {}
                        Recorded::AlreadyRecorded => return Ok(None),
                        Recorded::Dropped(outcome) => return Ok(Some(outcome)),
                    }
                    debug!(step = at.name, "Wait started");
                    at.attempt += 1;
                    now
                }
            }
        } else {
            now
        };

        match spec.kind() {
            StepKind::Task(step) => self.run_task(step, &at, lease, history).await,
            StepKind::Sleep(duration) => {
                let wake_at = since + to_time_delta(*duration)?;
                if self.clock.now() >= wake_at {
                    let output = at.input.clone();
                    return self.resolve_wait(&at, lease, output, history).await;
                }
                debug!(step = at.name, %wake_at, "Sleeping");
                self.finish(
                    lease,
                    InstanceUpdate::waiting(wake_at),
                    TurnOutcome::Waiting { wake_at },
                )
                .await
                .map(Some)
            }
            StepKind::Signal { name, timeout } => {
                let received = self.store.get_signal(instance.id, instance.run, name).await?;
                if let Some(signal) = received {
                    debug!(step = at.name, signal = %name, "Signal received");
                    return self.resolve_wait(&at, lease, signal.payload, history).await;
                }

                let deadline = at.deadline(since, *timeout)?;
                if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                    warn!(step = at.name, signal = %name, "Signal not received in time");
                    let info = ErrorInfo::new(format!("signal {} was not received in time", name))
                        .with_type("SIGNAL_TIMEOUT")
                        .at_step(at.name, at.attempt);
                    return self.fail_step(&at, lease, info, now, history).await;
                }

                debug!(step = at.name, signal = %name, "Waiting for signal");
                self.finish(
                    lease,
                    InstanceUpdate::awaiting_signal(name.clone(), deadline),
                    TurnOutcome::AwaitingSignal {
                        signal: name.clone(),
                        deadline,
                    },
                )
                .await
                .map(Some)
            }
            StepKind::Condition {
                check,
                interval,
                timeout,
            } => {
                let ctx = at.context(lease);
                match invoke(check, &ctx, at.input.clone()).await {
                    Ok(verdict) if verdict.as_value() == &serde_json::Value::Bool(true) => {
                        debug!(step = at.name, "Condition met");
                        let output = at.input.clone();
                        return self.resolve_wait(&at, lease, output, history).await;
                    }
                    Ok(_) => {}
                    Err(err)
                        if at.policy.classify(err.class, err.error_type.as_deref())
                            == ErrorClass::Fatal =>
                    {
                        error!(step = at.name, error = %err, "Condition check failed fatally");
                        let info = err.to_error_info(ErrorClass::Fatal, at.name, at.attempt);
                        return self.fail_step(&at, lease, info, now, history).await;
                    }
                    Err(err) => {
                        debug!(step = at.name, error = %err, "Condition check failed, treating as unmet")
                    }
                }

                let now = self.clock.now();
                let deadline = at.deadline(since, *timeout)?;
                if deadline.is_some_and(|deadline| now >= deadline) {
                    warn!(step = at.name, "Condition not met in time");
                    let info = ErrorInfo::new("condition was not met in time")
                        .with_type("CONDITION_TIMEOUT")
                        .at_step(at.name, at.attempt);
                    return self.fail_step(&at, lease, info, now, history).await;
                }

                let next_check = now + to_time_delta(*interval)?;
                let wake_at = deadline.map_or(next_check, |deadline| deadline.min(next_check));
                self.finish(
                    lease,
                    InstanceUpdate::waiting(wake_at),
                    TurnOutcome::Waiting { wake_at },
                )
                .await
                .map(Some)
            }
        }
    }

    async fn run_task(
        &self,
        step: &Arc<dyn Step>,
        at: &Position<'_>,
        lease: &LeaseHandle,
        history: &mut Vec<StepRecord>,
    ) -> Result<Option<TurnOutcome>, ExecutorError> {
        let ctx = at.context(lease);
        let attempt = at.attempt;

        debug!(step = at.name, attempt, "Executing step");
        let scheduled_at = self.clock.now();
        let result = invoke(step, &ctx, at.input.clone()).await;
        let completed_at = self.clock.now();

        let mut record = at.record(lease, StepStatus::Succeeded, scheduled_at);
        record.completed_at = Some(completed_at);

        let err = match result {
            Ok(output) => {
                record.output = Some(output);
                return Ok(match self.record_attempt(lease, record, history).await? {
                    Recorded::Appended => {
                        debug!(step = at.name, attempt, "Step succeeded");
                        None
                    }
                    Recorded::AlreadyRecorded => None,
                    Recorded::Dropped(outcome) => Some(outcome),
                });
            }
            Err(err) => err,
        };

        let class = at.policy.classify(err.class, err.error_type.as_deref());
        let (delay, reason) = match at.policy.decide(attempt, class) {
            RetryDecision::RetryAfter(delay) => (delay, None),
            RetryDecision::Fail(reason) => (std::time::Duration::ZERO, Some(reason)),
        };

        let Some(reason) = reason else {
            let wake_at = completed_at + to_time_delta(delay)?;
            let info = err.to_error_info(ErrorClass::Retryable, at.name, attempt);
            record.status = StepStatus::FailedRetryable;
            record.error = Some(info);
            record.retry_at = Some(wake_at);
            match self.record_attempt(lease, record, history).await? {
                Recorded::Appended => {}
                Recorded::AlreadyRecorded => return Ok(None),
                Recorded::Dropped(outcome) => return Ok(Some(outcome)),
            }

            warn!(
                step = at.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Step failed, retry scheduled"
            );
            return self
                .finish(
                    lease,
                    InstanceUpdate::waiting(wake_at),
                    TurnOutcome::Waiting { wake_at },
                )
                .await
                .map(Some);
        };

        match reason {
            FailReason::NonRetryable => {
                error!(step = at.name, attempt, error = %err, "Step failed fatally")
            }
            FailReason::AttemptsExhausted => {
                error!(step = at.name, attempt, error = %err, "Step exhausted retries")
            }
        }
        let info = err.to_error_info(ErrorClass::Fatal, at.name, attempt);
        self.fail_step(at, lease, info, scheduled_at, history).await
    }

    /// Record a wait step's output and move on
    async fn resolve_wait(
        &self,
        at: &Position<'_>,
        lease: &LeaseHandle,
        output: Payload,
        history: &mut Vec<StepRecord>,
    ) -> Result<Option<TurnOutcome>, ExecutorError> {
        let now = self.clock.now();
        let mut record = at.record(lease, StepStatus::Succeeded, now);
        record.output = Some(output);
        record.completed_at = Some(now);

        Ok(match self.record_attempt(lease, record, history).await? {
            Recorded::Appended | Recorded::AlreadyRecorded => None,
            Recorded::Dropped(outcome) => Some(outcome),
        })
    }

    /// Record a fatal attempt and fail the instance
    async fn fail_step(
        &self,
        at: &Position<'_>,
        lease: &LeaseHandle,
        info: ErrorInfo,
        scheduled_at: DateTime<Utc>,
        history: &mut Vec<StepRecord>,
    ) -> Result<Option<TurnOutcome>, ExecutorError> {
        let mut record = at.record(lease, StepStatus::FailedFatal, scheduled_at);
        record.error = Some(info.clone());
        record.completed_at = Some(self.clock.now());

        match self.record_attempt(lease, record, history).await? {
            Recorded::Appended => self
                .finish(lease, InstanceUpdate::failed(info), TurnOutcome::Failed)
                .await
                .map(Some),
            Recorded::AlreadyRecorded => Ok(None),
            Recorded::Dropped(outcome) => Ok(Some(outcome)),
        }
    }

    /// Append an attempt row and keep `history` in step with the store
    ///
    /// A row someone else already wrote is not fatal: if the lease is still
    /// ours the history is reloaded and replay decides what comes next.
    async fn record_attempt(
        &self,
        lease: &LeaseHandle,
        record: StepRecord,
        history: &mut Vec<StepRecord>,
    ) -> Result<Recorded, ExecutorError> {
        match self.store.append_step_attempt(record.clone()).await {
            Ok(()) => {
                history.push(record);
                Ok(Recorded::Appended)
            }
            Err(e @ StoreError::DuplicateAttempt { .. }) => {
                warn!("Attempt already recorded by another writer: {}", e);
                if let Some(outcome) = self.check_still_owned(lease).await? {
                    return Ok(Recorded::Dropped(outcome));
                }
                *history = self.store.load_steps(lease.instance_id()).await?;
                Ok(Recorded::AlreadyRecorded)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_nondeterministic(
        &self,
        lease: &LeaseHandle,
        err: ReplayError,
    ) -> Result<TurnOutcome, ExecutorError> {
        error!(error = %err, "Step history does not match the workflow definition");
        let info = ErrorInfo::new(err.to_string()).with_type("NON_DETERMINISTIC_HISTORY");
        self.finish(lease, InstanceUpdate::failed(info), TurnOutcome::Failed)
            .await
    }

    /// Write the turn's final update and translate lost races
    async fn finish(
        &self,
        lease: &LeaseHandle,
        update: InstanceUpdate,
        outcome: TurnOutcome,
    ) -> Result<TurnOutcome, ExecutorError> {
        match self.commit(lease, update).await? {
            Commit::Applied(record) => {
                debug!(state = %record.state, version = record.version, "Turn finished");
                Ok(outcome)
            }
            Commit::Superseded(state) => Ok(TurnOutcome::Superseded { state }),
            Commit::LeaseLost => Ok(TurnOutcome::LeaseLost),
        }
    }

    /// Conditional write using the lease's version
    ///
    /// On a lost race the instance is re-read: if we still own it and it is
    /// live the write is retried, otherwise the turn's results are dropped.
    async fn commit(
        &self,
        lease: &LeaseHandle,
        update: InstanceUpdate,
    ) -> Result<Commit, ExecutorError> {
        let instance_id = lease.instance_id();

        for _ in 0..=self.config.max_conflict_retries {
            let mut version = lease.lock_version().await;
            let now = self.clock.now();
            match self
                .store
                .update_instance(instance_id, *version, update.clone(), now)
                .await
            {
                Ok(record) => {
                    *version = record.version;
                    return Ok(Commit::Applied(record));
                }
                Err(e) if e.is_conflict() => {
                    debug!("Lost version race: {}", e);
                    let current = self.store.get_instance(instance_id).await?;
                    match self.reconcile(lease, &mut version, current, now).await? {
                        Some(commit) => return Ok(commit),
                        None => continue,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExecutorError::Contended(instance_id))
    }

    /// Verify nobody changed the instance since our last write
    async fn check_still_owned(
        &self,
        lease: &LeaseHandle,
    ) -> Result<Option<TurnOutcome>, ExecutorError> {
        let mut version = lease.lock_version().await;
        let current = self.store.get_instance(lease.instance_id()).await?;
        if current.version == *version {
            return Ok(None);
        }

        let now = self.clock.now();
        Ok(match self.reconcile(lease, &mut version, current, now).await? {
            Some(Commit::Superseded(state)) => Some(TurnOutcome::Superseded { state }),
            Some(Commit::LeaseLost) => Some(TurnOutcome::LeaseLost),
            Some(Commit::Applied(_)) | None => None,
        })
    }

    /// Decide what a changed instance means for the lease holder
    ///
    /// `None`: still ours and live, continue at the observed version.
    async fn reconcile(
        &self,
        lease: &LeaseHandle,
        version: &mut i64,
        current: InstanceRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Commit>, ExecutorError> {
        let owned = current.is_leased_by(lease.owner()) && current.active_lease(now).is_some();

        if current.state.is_terminal() {
            info!(state = %current.state, "Instance changed under the lease, dropping turn results");
            if current.is_leased_by(lease.owner()) {
                match self
                    .store
                    .release_lease(current.id, lease.owner(), current.version, now)
                    .await
                {
                    Ok(released) => *version = released,
                    Err(e) => debug!("Could not release lease on terminal instance: {}", e),
                }
            }
            lease.mark_lost();
            return Ok(Some(Commit::Superseded(current.state)));
        }

        if !owned {
            warn!("Lease taken over by another worker");
            lease.mark_lost();
            return Ok(Some(Commit::LeaseLost));
        }

        *version = current.version;
        Ok(None)
    }
}

/// Run a step, turning a panic into a retryable error
async fn invoke(
    step: &Arc<dyn Step>,
    ctx: &StepContext,
    input: Payload,
) -> Result<Payload, StepError> {
    AssertUnwindSafe(step.execute(ctx, input))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_to_error(panic)))
}

fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> StepError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    StepError::retryable(format!("step panicked: {}", message)).with_type("PANIC")
}
