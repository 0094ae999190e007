// Stepwise worker
// Decision: The binary is a thin shell over this library so the demo workflow stays unit-testable

pub mod orders;
pub mod runtime;

pub use runtime::{run, WorkerConfig};
