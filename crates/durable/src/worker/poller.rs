//! Due-work polling with exponential backoff
//!
//! Implements work claiming with adaptive polling intervals.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::clock::Clock;
use crate::persistence::{ClaimedInstance, StoreError, WorkflowStore};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when work is available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing is due
    pub backoff_multiplier: f64,

    /// Maximum instances to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Due-work poller with adaptive backoff
///
/// Backs off exponentially while nothing is due or the store is
/// unreachable, and drops back to the minimum interval as soon as a poll
/// claims something.
pub struct WorkPoller {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    lease_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkPoller {
    /// Create a new poller
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        clock: Arc<dyn Clock>,
        worker_id: String,
        lease_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id,
            lease_duration,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_instances` due instances
    ///
    /// Never claims more than the caller has room for.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_instances: usize) -> Result<Vec<ClaimedInstance>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("Poller shutdown requested");
            return Err(PollerError::Shutdown);
        }

        let limit = max_instances.min(self.config.batch_size);
        if limit == 0 {
            return Ok(vec![]);
        }

        let claimed = match self
            .store
            .claim_due_work(&self.worker_id, self.clock.now(), self.lease_duration, limit)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.increase_backoff();
                warn!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "Claim failed, backing off: {}", e
                );
                return Err(PollerError::Store(e));
            }
        };

        if claimed.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "Nothing due, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = claimed.len(), "Claimed instances");
        }

        Ok(claimed)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Poll again right away, e.g. when a worker slot frees up
    pub fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Dispatcher shutdown
    #[error("dispatcher is shutting down")]
    Shutdown,
}
