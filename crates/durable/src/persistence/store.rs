//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::{ErrorInfo, Payload};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// An instance with this id already exists
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {instance_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        instance_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Another writer already recorded this attempt
    #[error("step attempt already recorded: instance {instance_id} run {run} step {step_index} attempt {attempt}")]
    DuplicateAttempt {
        instance_id: Uuid,
        run: u32,
        step_index: u32,
        attempt: u32,
    },

    /// Write would move the instance along a transition the lifecycle forbids
    #[error("instance {instance_id} cannot move from {from} to {to}")]
    InvalidTransition {
        instance_id: Uuid,
        from: InstanceState,
        to: InstanceState,
    },

    /// Store unreachable (connection refused, pool exhausted, ...)
    #[error("persistence unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Lost a compare-and-swap race; re-read and retry
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::DuplicateAttempt { .. }
        )
    }

    /// Connectivity failure; retry with backoff
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Created, never claimed
    Created,

    /// Claimed and being advanced by a worker (or orphaned by a crashed one)
    Running,

    /// Waiting for `next_wake_at` (retry backoff) or a wake signal
    Waiting,

    /// All steps succeeded
    Completed,

    /// A step failed fatally or exhausted its retries
    Failed,

    /// Cancelled by the host
    Cancelled,
}

impl InstanceState {
    pub const ALL: [InstanceState; 6] = [
        Self::Created,
        Self::Running,
        Self::Waiting,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed lifecycle transitions
    ///
    /// Terminal states only leave through a re-run, which reopens the
    /// instance as `Created` under a new run generation.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Created, Running) | (Created, Cancelled) => true,
            (Running, Running) | (Running, Waiting) | (Running, Completed) => true,
            (Running, Failed) | (Running, Cancelled) => true,
            (Waiting, Running) | (Waiting, Waiting) | (Waiting, Cancelled) => true,
            (Completed, Created) | (Failed, Created) | (Cancelled, Created) => true,
            _ => false,
        }
    }

    /// States an instance may be in for a write moving it to `next`
    pub fn sources_of(next: InstanceState) -> Vec<InstanceState> {
        Self::ALL
            .into_iter()
            .filter(|state| state.can_transition_to(next))
            .collect()
    }

    pub(crate) fn ensure_transition(
        self,
        instance_id: Uuid,
        next: InstanceState,
    ) -> Result<(), StoreError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                instance_id,
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::Serialization(format!("unknown instance state: {}", s)))
    }
}

/// Status of a step execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Due for execution (derived, never persisted)
    Scheduled,

    /// In flight under a live lease (derived, never persisted)
    Running,

    /// A sleep, signal or condition step has started waiting
    Waiting,

    Succeeded,
    FailedRetryable,
    FailedFatal,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedFatal => "failed_fatal",
        }
    }

    /// Whether the row records a finished attempt
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedRetryable | Self::FailedFatal
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "succeeded" => Ok(Self::Succeeded),
            "failed_retryable" => Ok(Self::FailedRetryable),
            "failed_fatal" => Ok(Self::FailedFatal),
            other => Err(StoreError::Serialization(format!(
                "unknown step status: {}",
                other
            ))),
        }
    }
}

/// Time-bounded ownership of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Instance to be created
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: Uuid,
    pub workflow_type: String,
    pub input: Payload,
}

/// Workflow instance as stored
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub workflow_type: String,
    pub state: InstanceState,
    pub input: Payload,
    /// Present only when COMPLETED
    pub result: Option<Payload>,
    /// Present only when FAILED
    pub error: Option<ErrorInfo>,
    pub version: i64,
    /// Run generation, bumped by re-runs
    pub run: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_wake_at: Option<DateTime<Utc>>,
    /// Signal whose delivery makes a WAITING instance due
    pub awaiting_signal: Option<String>,
    pub lease: Option<Lease>,
}

impl InstanceRecord {
    /// Lease held by anyone and not yet expired
    pub fn active_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|lease| !lease.is_expired(now))
    }

    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.owner == owner)
    }

    /// Eligible for `claim_due_work` at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal()
            && self.next_wake_at.is_some_and(|wake| wake <= now)
            && self.active_lease(now).is_none()
    }
}

/// An instance this caller now owns
#[derive(Debug, Clone)]
pub struct ClaimedInstance {
    /// The instance after the claim (state RUNNING, lease set, version bumped)
    pub instance: InstanceRecord,

    /// State before the claim; RUNNING means an expired lease was reclaimed
    pub previous_state: InstanceState,
}

impl ClaimedInstance {
    pub fn was_orphaned(&self) -> bool {
        self.previous_state == InstanceState::Running
    }
}

/// Immutable record of one step attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub instance_id: Uuid,
    pub run: u32,
    pub step_index: u32,
    pub step_name: String,
    /// 1-based, per (instance, run, step_index)
    pub attempt: u32,
    pub status: StepStatus,
    pub input: Payload,
    pub output: Option<Payload>,
    pub error: Option<ErrorInfo>,
    pub worker_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest start of the next attempt, on FAILED_RETRYABLE rows
    pub retry_at: Option<DateTime<Utc>>,
}

/// Named payload delivered to an instance from outside
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub instance_id: Uuid,
    /// Run the signal was delivered to; re-runs start without signals
    pub run: u32,
    pub name: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

/// Conditional instance mutation
///
/// Every field is written as given: `None` clears the column.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub state: InstanceState,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
    pub error: Option<ErrorInfo>,
    /// Signal to wait for; made due at once if it already arrived
    pub awaiting_signal: Option<String>,
    /// Clear the lease columns in the same write
    pub release_lease: bool,
}

impl InstanceUpdate {
    /// Park until `wake_at`
    pub fn waiting(wake_at: DateTime<Utc>) -> Self {
        Self {
            state: InstanceState::Waiting,
            next_wake_at: Some(wake_at),
            result: None,
            error: None,
            awaiting_signal: None,
            release_lease: true,
        }
    }

    /// Stay RUNNING but give up the lease so any dispatcher can continue at `wake_at`
    pub fn yielded(wake_at: DateTime<Utc>) -> Self {
        Self {
            state: InstanceState::Running,
            ..Self::waiting(wake_at)
        }
    }

    pub fn completed(result: Payload) -> Self {
        Self {
            state: InstanceState::Completed,
            next_wake_at: None,
            result: Some(result),
            error: None,
            awaiting_signal: None,
            release_lease: true,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            state: InstanceState::Failed,
            next_wake_at: None,
            result: None,
            error: Some(error),
            awaiting_signal: None,
            release_lease: true,
        }
    }

    /// Park until `signal` arrives, or until `deadline` if one is given
    pub fn awaiting_signal(signal: impl Into<String>, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            state: InstanceState::Waiting,
            next_wake_at: deadline,
            result: None,
            error: None,
            awaiting_signal: Some(signal.into()),
            release_lease: true,
        }
    }

    /// Keep the lease columns untouched
    pub fn keeping_lease(mut self) -> Self {
        self.release_lease = false;
        self
    }
}

/// Result of a successful lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub version: i64,
    pub expires_at: DateTime<Utc>,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Instance is now CANCELLED
    Cancelled { version: i64 },

    /// Instance was already terminal; nothing changed
    AlreadyTerminal(InstanceState),
}

/// Result of delivering a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDelivery {
    /// Stored for `run`; `woke` is true if a WAITING instance was made due
    Delivered { run: u32, woke: bool },

    /// The current run already holds a signal with this name; the first one wins
    AlreadyDelivered,

    /// Instance is terminal; nothing stored
    AlreadyTerminal(InstanceState),
}

/// Store for workflow instances and their step history
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access from
/// several engine processes. All timestamps are supplied by the caller.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create an instance in CREATED, version 0, run 1, due at `now`
    async fn create_instance(
        &self,
        instance: NewInstance,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError>;

    /// Get an instance
    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StoreError>;

    /// Conditionally update an instance
    ///
    /// Fails with `ConcurrencyConflict` when `expected_version` is stale and
    /// with `InvalidTransition` when the lifecycle forbids the state change;
    /// otherwise applies the whole update and increments `version`. An update
    /// carrying `awaiting_signal` for a signal the current run already holds
    /// is made due at `now` instead of at `next_wake_at`.
    async fn update_instance(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        update: InstanceUpdate,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError>;

    /// Start a new run of a terminal instance
    ///
    /// Atomically bumps `run`, moves the instance to CREATED due at `now`,
    /// clears result, error and lease, and appends `carried` rows under the
    /// new run. Either all of it happens or none of it does.
    async fn reopen_instance(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        carried: Vec<StepRecord>,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError>;

    /// Cancel unless already terminal; does not require the lease
    async fn cancel_instance(
        &self,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError>;

    // =========================================================================
    // Leasing
    // =========================================================================

    /// Lease up to `limit` due instances
    ///
    /// Due means non-terminal, `next_wake_at <= now` and lease absent or
    /// expired. Rows locked by a concurrent claimer are skipped.
    async fn claim_due_work(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedInstance>, StoreError>;

    /// Extend a held lease to `now + extension`
    async fn renew_lease(
        &self,
        instance_id: Uuid,
        owner: &str,
        expected_version: i64,
        now: DateTime<Utc>,
        extension: Duration,
    ) -> Result<LeaseGrant, StoreError>;

    /// Give up a held lease, returning the new version
    async fn release_lease(
        &self,
        instance_id: Uuid,
        owner: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    // =========================================================================
    // Step History
    // =========================================================================

    /// Append an immutable attempt row
    ///
    /// Fails with `DuplicateAttempt` if (instance, run, step_index, attempt)
    /// is already recorded.
    async fn append_step_attempt(&self, record: StepRecord) -> Result<(), StoreError>;

    /// All attempt rows ordered by run, step_index, attempt
    async fn load_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // Signals
    // =========================================================================

    /// Store a named signal for the instance's current run
    ///
    /// A WAITING instance whose `awaiting_signal` matches is made due at
    /// `now`. Instances in any other state are left untouched so a lease
    /// holder's version is never bumped from outside.
    async fn deliver_signal(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<SignalDelivery, StoreError>;

    /// Signal delivered to `run` under `name`, if any
    async fn get_signal(
        &self,
        instance_id: Uuid,
        run: u32,
        name: &str,
    ) -> Result<Option<Signal>, StoreError>;
}

/// Convert a lease/backoff duration for timestamp arithmetic
///
/// Truncated to microseconds so derived timestamps round-trip through
/// PostgreSQL unchanged.
pub(crate) fn to_time_delta(duration: Duration) -> Result<TimeDelta, StoreError> {
    i64::try_from(duration.as_micros())
        .map(TimeDelta::microseconds)
        .map_err(|e| StoreError::Serialization(format!("duration out of range: {}", e)))
}
