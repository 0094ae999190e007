//! Dispatcher and leases for instance execution
//!
//! This module provides:
//! - [`Dispatcher`] - Polling control loop over a bounded pool of turns
//! - [`WorkPoller`] - Due-work claiming with exponential backoff
//! - [`LeaseHandle`] / [`LeaseKeeper`] - Lease ownership and renewal
//! - [`HealthMonitor`] - Store connectivity tracking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  ┌─────────────┐         ┌───────────────────────────────┐  │
//! │  │ WorkPoller  │────────▶│  claim_due_work(free slots)   │  │
//! │  │  (backoff)  │         └───────────────────────────────┘  │
//! │  └──────┬──────┘                                            │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │           Turns (Semaphore-limited)                  │    │
//! │  │  [Turn 1] [Turn 2] ... [Turn N]                      │    │
//! │  │  each: LeaseKeeper + WorkflowExecutor::run_turn      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stepwise_durable::worker::{Dispatcher, DispatcherConfig};
//!
//! let config = DispatcherConfig::from_env()?;
//! let dispatcher = Dispatcher::new(executor, config)?;
//!
//! dispatcher.start().await?;
//!
//! // Graceful shutdown
//! dispatcher.shutdown().await?;
//! ```

mod dispatcher;
mod health;
mod lease;
mod poller;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherError, DispatcherStatus};
pub use health::{HealthMonitor, HealthStatus};
pub use lease::{LeaseHandle, LeaseKeeper};
pub use poller::{PollerConfig, PollerError, WorkPoller};
