//! Store connectivity health
//!
//! Tracks consecutive infrastructure failures seen by the dispatcher. Any
//! successful store round trip resets the count.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tracing::{info, warn};

/// Dispatcher health as seen by its store calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The store has been unreachable for this many consecutive calls
    Degraded { consecutive_failures: u32 },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Consecutive-failure counter with a degradation threshold
#[derive(Debug)]
pub struct HealthMonitor {
    degraded_after: u32,
    consecutive_failures: AtomicU32,
}

impl HealthMonitor {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            degraded_after: degraded_after.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous >= self.degraded_after {
            info!(failures = previous, "Store reachable again");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == self.degraded_after {
            warn!(failures, "Store unreachable, dispatcher degraded");
        }
    }

    pub fn status(&self) -> HealthStatus {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures >= self.degraded_after {
            HealthStatus::Degraded {
                consecutive_failures: failures,
            }
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_after_threshold() {
        let health = HealthMonitor::new(3);

        health.record_failure();
        health.record_failure();
        assert!(health.status().is_healthy());

        health.record_failure();
        assert_eq!(
            health.status(),
            HealthStatus::Degraded {
                consecutive_failures: 3
            }
        );
    }

    #[test]
    fn test_success_resets() {
        let health = HealthMonitor::new(1);
        health.record_failure();
        assert!(!health.status().is_healthy());

        health.record_success();
        assert_eq!(health.status(), HealthStatus::Healthy);
    }
}
