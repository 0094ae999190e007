//! Dispatcher: claims due instances and runs them on a bounded pool
//!
//! A single control loop polls the store for due work and hands each
//! claimed instance to a spawned task. The pool size bounds concurrency;
//! the loop never claims more instances than it has free slots for.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::health::{HealthMonitor, HealthStatus};
use super::lease::{LeaseHandle, LeaseKeeper};
use super::poller::{PollerConfig, PollerError, WorkPoller};
use crate::config::{self, ConfigError};
use crate::engine::{ExecutorError, TurnOutcome, WorkflowExecutor};
use crate::persistence::ClaimedInstance;
use crate::reliability::duration_millis;

/// Dispatcher configuration
///
/// `lease_duration` must comfortably exceed the clock skew between engine
/// processes: a dispatcher whose clock runs ahead can reclaim a lease its
/// holder still believes is live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Lease owner id written on claimed instances
    pub worker_id: String,

    /// Maximum instances executing at once
    pub pool_size: usize,

    /// How long a claim or renewal keeps the lease
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Renew every `lease_duration * renew_fraction`
    pub renew_fraction: f64,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Consecutive store failures before reporting degraded health
    pub degraded_after: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            pool_size: 10,
            lease_duration: Duration::from_secs(30),
            renew_fraction: 1.0 / 3.0,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            degraded_after: 3,
        }
    }
}

impl DispatcherConfig {
    /// Create a new dispatcher configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the pool size
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_renew_fraction(mut self, fraction: f64) -> Self {
        self.renew_fraction = fraction;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_degraded_after(mut self, failures: u32) -> Self {
        self.degraded_after = failures.max(1);
        self
    }

    /// Interval between lease renewals
    pub fn renew_interval(&self) -> Duration {
        self.lease_duration.mul_f64(self.renew_fraction)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.is_empty() {
            return Err(ConfigError::Invalid("worker_id must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".to_string()));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be positive".to_string()));
        }
        if !(self.renew_fraction > 0.0 && self.renew_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "renew_fraction must be between 0 and 1, got {}",
                self.renew_fraction
            )));
        }
        if self.poller.min_interval > self.poller.max_interval {
            return Err(ConfigError::Invalid(
                "poll min_interval exceeds max_interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Create configuration from `STEPWISE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(config::process_env)
    }

    pub(crate) fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let poller = PollerConfig {
            min_interval: config::millis_or(
                &lookup,
                "STEPWISE_POLL_MIN_INTERVAL_MS",
                defaults.poller.min_interval,
            )?,
            max_interval: config::millis_or(
                &lookup,
                "STEPWISE_POLL_MAX_INTERVAL_MS",
                defaults.poller.max_interval,
            )?,
            backoff_multiplier: defaults.poller.backoff_multiplier,
            batch_size: config::var_or(
                &lookup,
                "STEPWISE_POLL_BATCH_SIZE",
                defaults.poller.batch_size,
            )?,
        };

        let config = Self {
            worker_id: lookup("STEPWISE_WORKER_ID").unwrap_or(defaults.worker_id),
            pool_size: config::var_or(&lookup, "STEPWISE_POOL_SIZE", defaults.pool_size)?,
            lease_duration: config::millis_or(
                &lookup,
                "STEPWISE_LEASE_DURATION_MS",
                defaults.lease_duration,
            )?,
            renew_fraction: config::var_or(
                &lookup,
                "STEPWISE_RENEW_FRACTION",
                defaults.renew_fraction,
            )?,
            poller,
            shutdown_timeout: config::millis_or(
                &lookup,
                "STEPWISE_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            )?,
            degraded_after: config::var_or(
                &lookup,
                "STEPWISE_DEGRADED_AFTER",
                defaults.degraded_after,
            )?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Dispatcher status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherStatus {
    /// Dispatcher is starting up
    Starting,
    /// Dispatcher is claiming and running instances
    Running,
    /// Dispatcher is draining (finishing current turns, not claiming new ones)
    Draining,
    /// Dispatcher has stopped
    Stopped,
}

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// Invalid configuration
    #[error("invalid dispatcher configuration: {0}")]
    Config(#[from] ConfigError),

    /// Dispatcher already running
    #[error("dispatcher is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {remaining} turns still running")]
    ShutdownTimeout { remaining: usize },
}

/// Everything a spawned turn needs
#[derive(Clone)]
struct TurnContext {
    executor: Arc<WorkflowExecutor>,
    health: Arc<HealthMonitor>,
    slot_freed: Arc<Notify>,
    renew_interval: Duration,
    lease_duration: Duration,
}

/// Polling dispatcher with a bounded worker pool
///
/// # Example
///
/// ```ignore
/// use stepwise_durable::prelude::*;
///
/// let config = DispatcherConfig::new()
///     .with_worker_id("orders-1")
///     .with_pool_size(20);
///
/// let dispatcher = Dispatcher::new(executor, config)?;
/// dispatcher.start().await?;
///
/// // ... later, graceful shutdown
/// dispatcher.shutdown().await?;
/// ```
pub struct Dispatcher {
    executor: Arc<WorkflowExecutor>,
    config: DispatcherConfig,
    health: Arc<HealthMonitor>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<DispatcherStatus>,
    slots: Arc<Semaphore>,
    slot_freed: Arc<Notify>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        executor: Arc<WorkflowExecutor>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatcherError> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            executor,
            health: Arc::new(HealthMonitor::new(config.degraded_after)),
            shutdown_tx,
            status: RwLock::new(DispatcherStatus::Stopped),
            slots: Arc::new(Semaphore::new(config.pool_size)),
            slot_freed: Arc::new(Notify::new()),
            poll_handle: Mutex::new(None),
            config,
        })
    }

    /// Start claiming and running due instances
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), DispatcherError> {
        {
            let mut status = self.status.write();
            if *status != DispatcherStatus::Stopped {
                return Err(DispatcherError::AlreadyRunning);
            }
            *status = DispatcherStatus::Starting;
        }

        info!(
            worker_id = %self.config.worker_id,
            pool_size = self.config.pool_size,
            lease_ms = self.config.lease_duration.as_millis() as u64,
            "Starting dispatcher"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        *self.status.write() = DispatcherStatus::Running;

        Ok(())
    }

    /// Stop claiming, then wait for running turns to finish
    ///
    /// Turns still running at the timeout keep their leases, which expire
    /// and let another dispatcher resume the instances.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), DispatcherError> {
        {
            let mut status = self.status.write();
            if *status == DispatcherStatus::Stopped {
                return Ok(());
            }
            *status = DispatcherStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!("Poll loop panicked: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let running = self.active_turns();
            if running == 0 {
                debug!("All turns completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_turns = running, "Shutdown timeout reached");
                *self.status.write() = DispatcherStatus::Stopped;
                return Err(DispatcherError::ShutdownTimeout { remaining: running });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = DispatcherStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Dispatcher stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> DispatcherStatus {
        *self.status.read()
    }

    /// Store connectivity as observed by this dispatcher
    pub fn health(&self) -> HealthStatus {
        self.health.status()
    }

    /// Turns currently executing
    pub fn active_turns(&self) -> usize {
        self.config.pool_size - self.slots.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();
        let health = Arc::clone(&self.health);
        let slots = Arc::clone(&self.slots);
        let slot_freed = Arc::clone(&self.slot_freed);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let turns = TurnContext {
            executor: Arc::clone(&executor),
            health: Arc::clone(&health),
            slot_freed: Arc::clone(&slot_freed),
            renew_interval: config.renew_interval(),
            lease_duration: config.lease_duration,
        };

        let handle = tokio::spawn(async move {
            let mut poller = WorkPoller::new(
                Arc::clone(executor.store()),
                Arc::clone(executor.clock()),
                config.worker_id.clone(),
                config.lease_duration,
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let free_slots = slots.available_permits();
                if free_slots > 0 {
                    match poller.poll(free_slots).await {
                        Ok(claims) => {
                            health.record_success();
                            for claim in claims {
                                dispatch(&turns, &slots, claim).await;
                            }
                        }
                        Err(PollerError::Shutdown) => break,
                        Err(PollerError::Store(e)) => {
                            if e.is_unavailable() {
                                health.record_failure();
                            }
                            error!("Poll error: {}", e);
                        }
                    }
                }

                // A finished turn frees a slot: poll again right away
                let slot_freed_early = tokio::select! {
                    stop = poller.wait() => {
                        if stop {
                            break;
                        }
                        false
                    }
                    _ = slot_freed.notified() => true,
                };
                if slot_freed_early {
                    poller.reset_backoff();
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

/// Run a claimed instance on a free slot, or hand it back
async fn dispatch(turns: &TurnContext, slots: &Arc<Semaphore>, claim: ClaimedInstance) {
    let instance_id = claim.instance.id;
    let Some(lease) = LeaseHandle::from_claim(&claim) else {
        warn!(%instance_id, "Claimed instance carries no lease");
        return;
    };

    match Arc::clone(slots).try_acquire_owned() {
        Ok(permit) => {
            tokio::spawn(run_turn(turns.clone(), claim, lease, permit));
        }
        Err(_) => {
            debug!(%instance_id, "No free slot, releasing lease");
            let store = turns.executor.store();
            let now = turns.executor.clock().now();
            if let Err(e) = lease.release(store.as_ref(), now).await {
                warn!(%instance_id, "Failed to release unneeded lease: {}", e);
            }
        }
    }
}

async fn run_turn(
    turns: TurnContext,
    claim: ClaimedInstance,
    lease: LeaseHandle,
    permit: OwnedSemaphorePermit,
) {
    let instance_id = claim.instance.id;
    let executor = &turns.executor;

    let keeper = LeaseKeeper::spawn(
        lease.clone(),
        Arc::clone(executor.store()),
        Arc::clone(executor.clock()),
        turns.renew_interval,
        turns.lease_duration,
    );
    let result = executor.run_turn(&claim, &lease).await;
    keeper.stop().await;

    settle(&turns, &lease, result).await;

    drop(permit);
    turns.slot_freed.notify_one();
}

/// Record the turn's result and hand back a lease the turn did not settle
async fn settle(
    turns: &TurnContext,
    lease: &LeaseHandle,
    result: Result<TurnOutcome, ExecutorError>,
) {
    let instance_id = lease.instance_id();
    let executor = &turns.executor;
    let now = executor.clock().now();

    match result {
        Ok(TurnOutcome::LeaseLost) => {
            turns.health.record_success();
            warn!(%instance_id, "Lease lost during turn");
            // Only succeeds if the lease columns still name us
            if let Err(e) = lease.release(executor.store().as_ref(), now).await {
                debug!(%instance_id, "Lease already gone: {}", e);
            }
        }
        Ok(outcome) => {
            turns.health.record_success();
            debug!(%instance_id, ?outcome, "Turn finished");
        }
        Err(e) => {
            if e.is_unavailable() {
                turns.health.record_failure();
            }
            error!(%instance_id, "Turn failed: {}", e);
            if !lease.is_lost() {
                if let Err(e) = lease.release(executor.store().as_ref(), now).await {
                    // Left to expire; any dispatcher reclaims it afterwards
                    warn!(%instance_id, "Failed to release lease: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::engine::{WorkflowDefinition, WorkflowRegistry};
    use crate::payload::Payload;
    use crate::persistence::{InMemoryWorkflowStore, InstanceState};
    use crate::persistence::WorkflowStore;
    use crate::step::{step_fn, StepContext};
    use std::collections::HashMap;

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig::new()
            .with_worker_id("test-dispatcher")
            .with_pool_size(2)
            .with_poller(
                PollerConfig::new()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    fn executor(store: Arc<InMemoryWorkflowStore>) -> Arc<WorkflowExecutor> {
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                WorkflowDefinition::builder("echo")
                    .step("first", step_fn(|_: StepContext, input: Payload| async move { Ok(input) }))
                    .step("second", step_fn(|_: StepContext, input: Payload| async move { Ok(input) }))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(WorkflowExecutor::new(
            store,
            Arc::new(registry),
            Arc::new(SystemClock),
        ))
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.renew_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_lease_settings() {
        let zero = DispatcherConfig::new().with_lease_duration(Duration::ZERO);
        assert!(zero.validate().is_err());

        let whole = DispatcherConfig::new().with_renew_fraction(1.0);
        assert!(whole.validate().is_err());
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("STEPWISE_WORKER_ID", "orders-1"),
            ("STEPWISE_POOL_SIZE", "4"),
            ("STEPWISE_LEASE_DURATION_MS", "9000"),
            ("STEPWISE_POLL_MAX_INTERVAL_MS", "1000"),
        ]
        .into_iter()
        .collect();

        let config =
            DispatcherConfig::from_vars(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.worker_id, "orders-1");
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(9));
        assert_eq!(config.renew_interval(), Duration::from_secs(3));
        assert_eq!(config.poller.max_interval, Duration::from_secs(1));
        assert_eq!(config.degraded_after, 3);
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let config = fast_config();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease_duration"], 30_000);
        assert_eq!(json["poller"]["min_interval"], 5);

        let parsed: DispatcherConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_runs_instances_to_completion() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = executor(store.clone());
        for _ in 0..5 {
            executor.start("echo", Payload::null()).await.unwrap();
        }

        let dispatcher = Dispatcher::new(executor, fast_config()).unwrap();
        dispatcher.start().await.unwrap();
        assert_eq!(dispatcher.status(), DispatcherStatus::Running);
        assert!(matches!(
            dispatcher.start().await,
            Err(DispatcherError::AlreadyRunning)
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.count_in_state(InstanceState::Completed) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all instances complete");

        dispatcher.shutdown().await.unwrap();
        assert_eq!(dispatcher.status(), DispatcherStatus::Stopped);
        assert_eq!(dispatcher.active_turns(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_health() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let dispatcher = Dispatcher::new(
            executor(store.clone()),
            fast_config().with_degraded_after(2),
        )
        .unwrap();

        store.fail_next(usize::MAX);
        dispatcher.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.health().is_healthy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("health degrades");

        store.fail_next(0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !dispatcher.health().is_healthy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("health recovers");

        dispatcher.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_lease_is_released_if_still_held() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let executor = executor(store.clone());
        let id = executor.start("echo", Payload::null()).await.unwrap();
        let claim = store
            .claim_due_work("test-dispatcher", executor.clock().now(), Duration::from_secs(30), 1)
            .await
            .unwrap()
            .remove(0);
        let lease = LeaseHandle::from_claim(&claim).unwrap();
        lease.mark_lost();

        let turns = TurnContext {
            executor,
            health: Arc::new(HealthMonitor::new(3)),
            slot_freed: Arc::new(Notify::new()),
            renew_interval: Duration::from_secs(10),
            lease_duration: Duration::from_secs(30),
        };
        settle(&turns, &lease, Ok(TurnOutcome::LeaseLost)).await;

        let record = store.get_instance(id).await.unwrap();
        assert_eq!(record.state, InstanceState::Running);
        assert!(record.lease.is_none());
        assert!(turns.health.status().is_healthy());
    }

    #[tokio::test]
    async fn test_shutdown_timeout_stops_dispatcher() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let mut registry = WorkflowRegistry::new();
        registry
            .register(
                WorkflowDefinition::builder("slow")
                    .step(
                        "sleep",
                        step_fn(|_: StepContext, input: Payload| async move {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(input)
                        }),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(SystemClock),
        ));
        executor.start("slow", Payload::null()).await.unwrap();

        let dispatcher = Dispatcher::new(
            executor,
            fast_config().with_shutdown_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        dispatcher.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.active_turns() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("turn starts");

        let result = dispatcher.shutdown().await;
        assert!(matches!(
            result,
            Err(DispatcherError::ShutdownTimeout { remaining: 1 })
        ));
        assert_eq!(dispatcher.status(), DispatcherStatus::Stopped);

        // Stopped, so it can be started again
        dispatcher.start().await.unwrap();
        assert_eq!(dispatcher.status(), DispatcherStatus::Running);
    }
}
