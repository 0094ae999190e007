//! Host-facing view of an instance

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::payload::{ErrorInfo, Payload};
use crate::persistence::{InstanceRecord, InstanceState, StepRecord, StepStatus};

use super::registry::WorkflowDefinition;
use super::replay::{latest_attempt, replay, NextAction};

/// The step an instance is on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentStep {
    pub index: u32,
    pub name: String,
    pub attempt: u32,
    /// SCHEDULED, RUNNING or WAITING while pending, the recorded status once failed
    pub status: StepStatus,
}

/// Result of `get_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance_id: Uuid,
    pub workflow_type: String,
    pub state: InstanceState,
    pub run: u32,
    pub version: i64,
    pub current_step: Option<CurrentStep>,
    pub result: Option<Payload>,
    pub error: Option<ErrorInfo>,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceStatus {
    /// Build the view from stored state
    ///
    /// `definition` is `None` when the workflow type is no longer
    /// registered; the current step is then unknown.
    pub fn derive(
        instance: InstanceRecord,
        history: &[StepRecord],
        definition: Option<&WorkflowDefinition>,
        now: DateTime<Utc>,
    ) -> Self {
        let current_step = match instance.state {
            InstanceState::Completed | InstanceState::Cancelled => None,
            InstanceState::Failed => history
                .iter()
                .filter(|r| r.run == instance.run && r.status == StepStatus::FailedFatal)
                .last()
                .map(|r| CurrentStep {
                    index: r.step_index,
                    name: r.step_name.clone(),
                    attempt: r.attempt,
                    status: r.status,
                }),
            InstanceState::Created | InstanceState::Running | InstanceState::Waiting => {
                definition.and_then(|definition| pending_step(&instance, history, definition, now))
            }
        };

        Self {
            instance_id: instance.id,
            workflow_type: instance.workflow_type,
            state: instance.state,
            run: instance.run,
            version: instance.version,
            current_step,
            result: instance.result,
            error: instance.error,
            next_wake_at: instance.next_wake_at,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

fn pending_step(
    instance: &InstanceRecord,
    history: &[StepRecord],
    definition: &WorkflowDefinition,
    now: DateTime<Utc>,
) -> Option<CurrentStep> {
    let replayed = replay(definition, &instance.input, history, instance.run).ok()?;
    let NextAction::Execute {
        step_index,
        attempt,
        ..
    } = replayed.next
    else {
        return None;
    };

    let parked = instance.state == InstanceState::Waiting
        && latest_attempt(history, instance.run, step_index)
            .is_some_and(|row| row.status == StepStatus::Waiting);

    let status = if parked {
        StepStatus::Waiting
    } else if instance.active_lease(now).is_some() {
        StepStatus::Running
    } else {
        StepStatus::Scheduled
    };

    Some(CurrentStep {
        index: step_index,
        name: definition.step(step_index)?.name().to_string(),
        attempt,
        status,
    })
}
