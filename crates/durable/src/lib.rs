//! # Durable Workflow Execution Engine
//!
//! A PostgreSQL-backed engine for reliable, multi-step workflows.
//!
//! ## Features
//!
//! - **Durable progress**: every step attempt is persisted; after a crash an
//!   instance resumes from its last recorded step on any process
//! - **Automatic retries**: configurable retry policies with capped
//!   exponential backoff and jitter
//! - **Leases with optimistic concurrency**: at most one worker advances an
//!   instance at a time, enforced by a time-bounded lease and a version
//!   compare-and-swap on every write
//! - **Polling dispatcher**: a bounded worker pool that never claims more
//!   instances than it can run
//! - **Waits**: durable sleeps, named signals carrying a payload, and polled
//!   conditions park an instance without holding a worker
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (host API, replays step history, records step outcomes)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                          │
//! │  (PostgreSQL: workflow_instances, step_executions)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (claims due instances, renews leases, runs turns)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepwise_durable::prelude::*;
//!
//! let ship_order = WorkflowDefinition::builder("ship-order")
//!     .step("reserveInventory", step_fn(|_ctx, order: Payload| async move {
//!         Ok(order)
//!     }))
//!     .step("charge", ChargeCard::new(gateway))
//!     .await_signal("approve", "approved", Some(Duration::from_secs(3600)))
//!     .step("notify", step_fn(|_ctx, receipt: Payload| async move {
//!         Ok(receipt)
//!     }))
//!     .retry_policy(RetryPolicy::exponential().with_max_attempts(3))
//!     .build()?;
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register(ship_order)?;
//!
//! let store = Arc::new(PostgresWorkflowStore::new(pool));
//! let executor = Arc::new(WorkflowExecutor::new(store, Arc::new(registry), Arc::new(SystemClock)));
//!
//! let dispatcher = Dispatcher::new(executor.clone(), DispatcherConfig::from_env()?)?;
//! dispatcher.start().await?;
//!
//! let id = executor.start("ship-order", Payload::encode(&order)?).await?;
//! executor.signal(id, "approved", Payload::encode(&approval)?).await?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod payload;
pub mod persistence;
pub mod reliability;
pub mod step;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, InstanceStatus, WorkflowDefinition, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::payload::{ErrorInfo, Payload};
    pub use crate::persistence::{
        InMemoryWorkflowStore, InstanceState, PostgresWorkflowStore, StepRecord, StepStatus,
        StoreError, WorkflowStore,
    };
    pub use crate::reliability::{ErrorClass, RetryPolicy};
    pub use crate::step::{step_fn, Step, StepContext, StepError};
    pub use crate::worker::{Dispatcher, DispatcherConfig, DispatcherError, HealthStatus};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ConfigError;
pub use engine::{
    ExecutorConfig, ExecutorError, InstanceStatus, RegistryError, StepKind, TurnOutcome,
    WorkflowDefinition, WorkflowExecutor, WorkflowRegistry,
};
pub use payload::{ErrorInfo, Payload, PayloadError};
pub use persistence::{
    InMemoryWorkflowStore, InstanceState, PostgresWorkflowStore, Signal, SignalDelivery,
    StepRecord, StepStatus, StoreError, WorkflowStore, MIGRATOR,
};
pub use reliability::{ErrorClass, RetryPolicy};
pub use step::{step_fn, Step, StepContext, StepError};
pub use worker::{Dispatcher, DispatcherConfig, DispatcherError, DispatcherStatus, HealthStatus};
