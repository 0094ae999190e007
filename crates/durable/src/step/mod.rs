//! Step abstractions
//!
//! Steps are the units of business logic a workflow runs in order. They:
//! - Receive the previous step's output (or the workflow input) as input
//! - May fail and be retried according to the retry policy
//! - Are told when their instance lease is lost so they can stop early

mod context;
mod definition;

pub use context::{LeaseSignal, StepContext};
pub use definition::{step_fn, FnStep, Step, StepError};
