//! Recompute an instance's next action from its persisted step history
//!
//! Replay is a pure function of (definition, workflow input, history, run):
//! no clock, no store and no randomness. Only SUCCEEDED rows of the current
//! run advance the position; failed rows only count toward the attempt
//! number. A step that has a SUCCEEDED row is never attempted again.
//! WAITING rows mark the start of a wait step and count as an attempt.

use crate::payload::Payload;
use crate::persistence::{StepRecord, StepStatus};

use super::registry::WorkflowDefinition;

/// Recorded history no longer matches the workflow definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// A step at this position was recorded under a different name
    #[error("step {step_index} was recorded as {recorded} but the definition names it {expected}")]
    StepMismatch {
        step_index: u32,
        expected: String,
        recorded: String,
    },

    /// History has steps past the end of the definition
    #[error("history records step {step_index} but the definition has only {defined} steps")]
    UnknownStep { step_index: u32, defined: usize },

    /// SUCCEEDED row without an output payload
    #[error("succeeded step {step_index} has no recorded output")]
    MissingOutput { step_index: u32 },
}

/// What the executor should do next
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Run this attempt of this step
    Execute {
        step_index: u32,
        attempt: u32,
        input: Payload,
    },

    /// Every step succeeded
    Complete { result: Payload },
}

/// Result of replaying history
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// Outputs of succeeded steps, in order, keyed by step name
    pub completed: Vec<(String, Payload)>,

    pub next: NextAction,
}

impl Replay {
    /// Step position the instance is at (the step count once complete)
    pub fn position(&self) -> usize {
        self.completed.len()
    }
}

/// Highest-numbered attempt row of one step in `run`
pub fn latest_attempt(history: &[StepRecord], run: u32, step_index: u32) -> Option<&StepRecord> {
    history
        .iter()
        .filter(|r| r.run == run && r.step_index == step_index)
        .max_by_key(|r| r.attempt)
}

/// Replay `history` for `run` against `definition`
pub fn replay(
    definition: &WorkflowDefinition,
    workflow_input: &Payload,
    history: &[StepRecord],
    run: u32,
) -> Result<Replay, ReplayError> {
    let rows: Vec<&StepRecord> = history.iter().filter(|r| r.run == run).collect();

    if let Some(row) = rows.iter().find(|r| r.step_index as usize >= definition.len()) {
        return Err(ReplayError::UnknownStep {
            step_index: row.step_index,
            defined: definition.len(),
        });
    }

    let mut completed = Vec::with_capacity(definition.len());
    for (index, spec) in definition.steps().iter().enumerate() {
        let step_index = index as u32;
        let step_rows = rows.iter().filter(|r| r.step_index == step_index);

        for row in step_rows.clone() {
            if row.step_name != spec.name() {
                return Err(ReplayError::StepMismatch {
                    step_index,
                    expected: spec.name().to_string(),
                    recorded: row.step_name.clone(),
                });
            }
        }

        let succeeded = step_rows
            .clone()
            .find(|r| r.status == StepStatus::Succeeded);

        match succeeded {
            Some(row) => {
                let output = row
                    .output
                    .clone()
                    .ok_or(ReplayError::MissingOutput { step_index })?;
                completed.push((spec.name().to_string(), output));
            }
            None => {
                let attempts = step_rows.map(|r| r.attempt).max().unwrap_or(0);
                let input = completed
                    .last()
                    .map(|(_, output): &(String, Payload)| output.clone())
                    .unwrap_or_else(|| workflow_input.clone());
                return Ok(Replay {
                    completed,
                    next: NextAction::Execute {
                        step_index,
                        attempt: attempts + 1,
                        input,
                    },
                });
            }
        }
    }

    let result = completed
        .last()
        .map(|(_, output)| output.clone())
        .unwrap_or_else(Payload::null);
    Ok(Replay {
        completed,
        next: NextAction::Complete { result },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::WorkflowDefinition;
    use crate::payload::ErrorInfo;
    use crate::step::{step_fn, StepContext, StepError};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn ship_order() -> WorkflowDefinition {
        let echo = || step_fn(|_: StepContext, input: Payload| async move { Ok::<_, StepError>(input) });
        WorkflowDefinition::builder("ship-order")
            .step("reserveInventory", echo())
            .step("charge", echo())
            .step("notify", echo())
            .build()
            .unwrap()
    }

    fn row(run: u32, index: u32, name: &str, attempt: u32, status: StepStatus) -> StepRecord {
        let now = Utc::now();
        StepRecord {
            instance_id: Uuid::nil(),
            run,
            step_index: index,
            step_name: name.to_string(),
            attempt,
            status,
            input: Payload::null(),
            output: (status == StepStatus::Succeeded)
                .then(|| Payload::new(json!({"from": name, "attempt": attempt}))),
            error: (status != StepStatus::Succeeded).then(|| ErrorInfo::new("declined")),
            worker_id: None,
            scheduled_at: now,
            completed_at: Some(now),
            retry_at: None,
        }
    }

    #[test]
    fn test_empty_history_starts_first_step_with_workflow_input() {
        let input = Payload::new(json!({"order_id": "A-1"}));
        let replay = replay(&ship_order(), &input, &[], 1).unwrap();

        assert_eq!(replay.position(), 0);
        assert_eq!(
            replay.next,
            NextAction::Execute {
                step_index: 0,
                attempt: 1,
                input,
            }
        );
    }

    #[test]
    fn test_failed_attempts_raise_attempt_number() {
        let history = vec![
            row(1, 0, "reserveInventory", 1, StepStatus::Succeeded),
            row(1, 1, "charge", 1, StepStatus::FailedRetryable),
            row(1, 1, "charge", 2, StepStatus::FailedRetryable),
        ];

        let replay = replay(&ship_order(), &Payload::null(), &history, 1).unwrap();
        assert_eq!(
            replay.next,
            NextAction::Execute {
                step_index: 1,
                attempt: 3,
                input: Payload::new(json!({"from": "reserveInventory", "attempt": 1})),
            }
        );
    }

    #[test]
    fn test_waiting_row_counts_as_attempt() {
        let history = vec![
            row(1, 0, "reserveInventory", 1, StepStatus::Succeeded),
            row(1, 1, "charge", 1, StepStatus::Waiting),
        ];

        let replay = replay(&ship_order(), &Payload::null(), &history, 1).unwrap();
        assert!(matches!(
            replay.next,
            NextAction::Execute {
                step_index: 1,
                attempt: 2,
                ..
            }
        ));
        assert_eq!(
            latest_attempt(&history, 1, 1).map(|r| r.status),
            Some(StepStatus::Waiting)
        );
        assert!(latest_attempt(&history, 2, 1).is_none());
    }

    #[test]
    fn test_all_succeeded_completes_with_last_output() {
        let history = vec![
            row(1, 0, "reserveInventory", 1, StepStatus::Succeeded),
            row(1, 1, "charge", 1, StepStatus::FailedRetryable),
            row(1, 1, "charge", 2, StepStatus::Succeeded),
            row(1, 2, "notify", 1, StepStatus::Succeeded),
        ];

        let replay = replay(&ship_order(), &Payload::null(), &history, 1).unwrap();
        assert_eq!(replay.position(), 3);
        assert_eq!(
            replay.next,
            NextAction::Complete {
                result: Payload::new(json!({"from": "notify", "attempt": 1})),
            }
        );
    }

    #[test]
    fn test_replay_is_deterministic_regardless_of_row_order() {
        let mut history = vec![
            row(1, 0, "reserveInventory", 1, StepStatus::Succeeded),
            row(1, 1, "charge", 1, StepStatus::FailedRetryable),
        ];
        let forward = replay(&ship_order(), &Payload::null(), &history, 1).unwrap();
        history.reverse();
        let backward = replay(&ship_order(), &Payload::null(), &history, 1).unwrap();

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_other_runs_are_ignored() {
        let history = vec![
            row(1, 0, "reserveInventory", 1, StepStatus::Succeeded),
            row(1, 1, "charge", 1, StepStatus::FailedFatal),
        ];

        let replay = replay(&ship_order(), &Payload::null(), &history, 2).unwrap();
        assert_eq!(replay.position(), 0);
        assert!(matches!(
            replay.next,
            NextAction::Execute {
                step_index: 0,
                attempt: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_renamed_step_is_detected() {
        let history = vec![row(1, 0, "reserve", 1, StepStatus::Succeeded)];

        let result = replay(&ship_order(), &Payload::null(), &history, 1);
        assert_eq!(
            result,
            Err(ReplayError::StepMismatch {
                step_index: 0,
                expected: "reserveInventory".to_string(),
                recorded: "reserve".to_string(),
            })
        );
    }

    #[test]
    fn test_history_past_definition_is_detected() {
        let history = vec![row(1, 5, "refund", 1, StepStatus::Succeeded)];

        let result = replay(&ship_order(), &Payload::null(), &history, 1);
        assert!(matches!(result, Err(ReplayError::UnknownStep { step_index: 5, .. })));
    }
}
