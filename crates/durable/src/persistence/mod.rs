//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowStore`] trait for instance, lease and step-history persistence
//! - [`InMemoryWorkflowStore`] for testing
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::{PostgresWorkflowStore, MIGRATOR};
pub use store::{
    CancelOutcome, ClaimedInstance, InstanceRecord, InstanceState, InstanceUpdate, Lease,
    LeaseGrant, NewInstance, Signal, SignalDelivery, StepRecord, StepStatus, StoreError,
    WorkflowStore,
};
pub(crate) use store::to_time_delta;
