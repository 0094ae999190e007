//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor`, which drives workflow
//! instances through their steps by replaying the recorded step history,
//! and the `WorkflowRegistry` of workflow definitions it executes.

mod executor;
mod registry;
mod replay;
mod status;

pub use executor::{ExecutorConfig, ExecutorError, TurnOutcome, WorkflowExecutor};
pub use registry::{
    RegistryError, StepKind, StepSpec, WorkflowDefinition, WorkflowDefinitionBuilder,
    WorkflowRegistry,
};
pub use replay::{latest_attempt, replay, NextAction, Replay, ReplayError};
pub use status::{CurrentStep, InstanceStatus};
