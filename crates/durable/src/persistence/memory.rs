//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::store::*;
use crate::payload::Payload;

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation: version
/// CAS, lease expiry, and unique (instance, run, step, attempt) rows.
/// Locks are always taken in the order instances, steps, signals.
///
/// # Example
///
/// ```
/// use stepwise_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    instances: RwLock<HashMap<Uuid, InstanceRecord>>,
    steps: RwLock<HashMap<Uuid, Vec<StepRecord>>>,
    signals: RwLock<HashMap<Uuid, Vec<Signal>>>,
    injected_failures: AtomicUsize,
    failing_ops: Mutex<HashMap<&'static str, usize>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            signals: RwLock::new(HashMap::new()),
            injected_failures: AtomicUsize::new(0),
            failing_ops: Mutex::new(HashMap::new()),
        }
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Get the number of instances in `state`
    pub fn count_in_state(&self, state: InstanceState) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| i.state == state)
            .count()
    }

    /// Make the next `count` operations fail with `StoreError::Unavailable`
    pub fn fail_next(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls of one trait method fail with
    /// `StoreError::Unavailable`, e.g. `fail_next_op("update_instance", 1)`
    pub fn fail_next_op(&self, op: &'static str, count: usize) {
        self.failing_ops.lock().insert(op, count);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
        self.steps.write().clear();
        self.signals.write().clear();
    }

    fn check_available(&self, op: &'static str) -> Result<(), StoreError> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let targeted = match self.failing_ops.lock().get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        if consumed || targeted {
            return Err(StoreError::Unavailable(format!(
                "injected failure in {}: connection refused",
                op
            )));
        }
        Ok(())
    }

    fn has_signal(&self, instance_id: Uuid, run: u32, name: &str) -> bool {
        self.signals
            .read()
            .get(&instance_id)
            .is_some_and(|signals| signals.iter().any(|s| s.run == run && s.name == name))
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(record: &InstanceRecord, expected_version: i64) -> Result<(), StoreError> {
    if record.version != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            instance_id: record.id,
            expected: expected_version,
            actual: record.version,
        });
    }
    Ok(())
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_instance(
        &self,
        instance: NewInstance,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        self.check_available("create_instance")?;
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.id) {
            return Err(StoreError::InstanceAlreadyExists(instance.id));
        }

        let record = InstanceRecord {
            id: instance.id,
            workflow_type: instance.workflow_type,
            state: InstanceState::Created,
            input: instance.input,
            result: None,
            error: None,
            version: 0,
            run: 1,
            created_at: now,
            updated_at: now,
            next_wake_at: Some(now),
            awaiting_signal: None,
            lease: None,
        };
        instances.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StoreError> {
        self.check_available("get_instance")?;
        self.instances
            .read()
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn update_instance(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        update: InstanceUpdate,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        self.check_available("update_instance")?;
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        check_version(record, expected_version)?;
        record.state.ensure_transition(instance_id, update.state)?;

        let signalled = update
            .awaiting_signal
            .as_deref()
            .is_some_and(|name| self.has_signal(instance_id, record.run, name));

        record.state = update.state;
        record.next_wake_at = if signalled {
            Some(now)
        } else {
            update.next_wake_at
        };
        record.result = update.result;
        record.error = update.error;
        record.awaiting_signal = update.awaiting_signal;
        if update.release_lease {
            record.lease = None;
        }
        record.version += 1;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn reopen_instance(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        carried: Vec<StepRecord>,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        self.check_available("reopen_instance")?;
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        check_version(record, expected_version)?;
        record.state.ensure_transition(instance_id, InstanceState::Created)?;

        let run = record.run + 1;
        let mut steps = self.steps.write();
        let history = steps.entry(instance_id).or_default();
        if let Some(existing) = history.iter().find(|r| r.run == run) {
            return Err(StoreError::DuplicateAttempt {
                instance_id,
                run,
                step_index: existing.step_index,
                attempt: existing.attempt,
            });
        }

        history.extend(carried.into_iter().map(|row| StepRecord {
            instance_id,
            run,
            ..row
        }));
        record.run = run;
        record.state = InstanceState::Created;
        record.next_wake_at = Some(now);
        record.result = None;
        record.error = None;
        record.awaiting_signal = None;
        record.lease = None;
        record.version += 1;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn cancel_instance(
        &self,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        self.check_available("cancel_instance")?;
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        if record.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(record.state));
        }

        record.state = InstanceState::Cancelled;
        record.next_wake_at = None;
        record.awaiting_signal = None;
        record.version += 1;
        record.updated_at = now;
        Ok(CancelOutcome::Cancelled {
            version: record.version,
        })
    }

    async fn claim_due_work(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedInstance>, StoreError> {
        self.check_available("claim_due_work")?;
        if limit == 0 {
            return Ok(vec![]);
        }
        let expires_at = now + to_time_delta(lease_duration)?;

        let mut instances = self.instances.write();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = instances
            .values()
            .filter(|i| i.is_due(now))
            .filter_map(|i| i.next_wake_at.map(|wake| (wake, i.id)))
            .collect();
        due.sort();

        let mut claimed = Vec::with_capacity(limit.min(due.len()));
        for (_, id) in due.into_iter().take(limit) {
            let Some(record) = instances.get_mut(&id) else {
                continue;
            };
            let previous_state = record.state;
            record.state = InstanceState::Running;
            record.lease = Some(Lease {
                owner: owner.to_string(),
                expires_at,
            });
            record.version += 1;
            record.updated_at = now;
            claimed.push(ClaimedInstance {
                instance: record.clone(),
                previous_state,
            });
        }

        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        instance_id: Uuid,
        owner: &str,
        expected_version: i64,
        now: DateTime<Utc>,
        extension: Duration,
    ) -> Result<LeaseGrant, StoreError> {
        self.check_available("renew_lease")?;
        let expires_at = now + to_time_delta(extension)?;

        let mut instances = self.instances.write();
        let record = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        check_version(record, expected_version)?;
        if !record.is_leased_by(owner) {
            return Err(StoreError::ConcurrencyConflict {
                instance_id,
                expected: expected_version,
                actual: record.version,
            });
        }

        record.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at,
        });
        record.version += 1;
        record.updated_at = now;
        Ok(LeaseGrant {
            version: record.version,
            expires_at,
        })
    }

    async fn release_lease(
        &self,
        instance_id: Uuid,
        owner: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.check_available("release_lease")?;
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        check_version(record, expected_version)?;
        if !record.is_leased_by(owner) {
            return Err(StoreError::ConcurrencyConflict {
                instance_id,
                expected: expected_version,
                actual: record.version,
            });
        }

        record.lease = None;
        record.version += 1;
        record.updated_at = now;
        Ok(record.version)
    }

    async fn append_step_attempt(&self, record: StepRecord) -> Result<(), StoreError> {
        self.check_available("append_step_attempt")?;
        if !self.instances.read().contains_key(&record.instance_id) {
            return Err(StoreError::InstanceNotFound(record.instance_id));
        }

        let mut steps = self.steps.write();
        let history = steps.entry(record.instance_id).or_default();
        let duplicate = history.iter().any(|r| {
            r.run == record.run && r.step_index == record.step_index && r.attempt == record.attempt
        });
        if duplicate {
            return Err(StoreError::DuplicateAttempt {
                instance_id: record.instance_id,
                run: record.run,
                step_index: record.step_index,
                attempt: record.attempt,
            });
        }

        history.push(record);
        Ok(())
    }

    async fn load_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        self.check_available("load_steps")?;
        if !self.instances.read().contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        let mut history = self
            .steps
            .read()
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        history.sort_by_key(|r| (r.run, r.step_index, r.attempt));
        Ok(history)
    }

    async fn deliver_signal(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<SignalDelivery, StoreError> {
        self.check_available("deliver_signal")?;
        let mut instances = self.instances.write();
        let record = instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        if record.state.is_terminal() {
            return Ok(SignalDelivery::AlreadyTerminal(record.state));
        }

        let mut signals = self.signals.write();
        let delivered = signals.entry(instance_id).or_default();
        if delivered.iter().any(|s| s.run == record.run && s.name == name) {
            return Ok(SignalDelivery::AlreadyDelivered);
        }
        delivered.push(Signal {
            instance_id,
            run: record.run,
            name: name.to_string(),
            payload,
            received_at: now,
        });

        let woke = record.state == InstanceState::Waiting
            && record.awaiting_signal.as_deref() == Some(name);
        if woke {
            record.next_wake_at = Some(now);
            record.version += 1;
            record.updated_at = now;
        }
        Ok(SignalDelivery::Delivered {
            run: record.run,
            woke,
        })
    }

    async fn get_signal(
        &self,
        instance_id: Uuid,
        run: u32,
        name: &str,
    ) -> Result<Option<Signal>, StoreError> {
        self.check_available("get_signal")?;
        if !self.instances.read().contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        Ok(self.signals.read().get(&instance_id).and_then(|signals| {
            signals
                .iter()
                .find(|s| s.run == run && s.name == name)
                .cloned()
        }))
    }
}
