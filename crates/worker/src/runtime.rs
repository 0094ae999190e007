// Worker process wiring
// Decision: Everything comes from environment variables so the same binary runs locally and in containers
// Decision: Migrations run on startup by default; disable with STEPWISE_RUN_MIGRATIONS=false when a deploy step owns them

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use stepwise_durable::config::var_or;
use stepwise_durable::{
    Dispatcher, DispatcherConfig, ExecutorConfig, Payload, PostgresWorkflowStore, SystemClock,
    WorkflowExecutor, MIGRATOR,
};

use crate::orders::{self, Order, SHIP_ORDER};

/// Worker process configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub run_migrations: bool,
    /// Demo orders started once the dispatcher is up
    pub demo_orders: u32,
    /// Probability in [0, 1] that a simulated charge times out
    pub charge_failure_rate: f64,
    pub dispatcher: DispatcherConfig,
    pub executor: ExecutorConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_vars(|name| std::env::var(name).ok())?;
        config.dispatcher = DispatcherConfig::from_env()?;
        config.executor = ExecutorConfig::from_env()?;
        Ok(config)
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            max_connections: var_or(&lookup, "STEPWISE_DB_MAX_CONNECTIONS", 10)?,
            run_migrations: var_or(&lookup, "STEPWISE_RUN_MIGRATIONS", true)?,
            demo_orders: var_or(&lookup, "STEPWISE_DEMO_ORDERS", 0)?,
            charge_failure_rate: var_or(&lookup, "STEPWISE_DEMO_FAILURE_RATE", 0.2)?,
            dispatcher: DispatcherConfig::default(),
            executor: ExecutorConfig::default(),
        })
    }
}

/// Run the worker until `shutdown` resolves, then drain in-flight turns
pub async fn run(config: WorkerConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    if config.run_migrations {
        MIGRATOR
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        info!("Migrations applied");
    }

    let registry = orders::registry(config.charge_failure_rate)?;
    info!(workflows = ?registry.workflow_types(), "Registered workflows");

    let executor = Arc::new(WorkflowExecutor::with_config(
        Arc::new(PostgresWorkflowStore::new(pool)),
        Arc::new(registry),
        Arc::new(SystemClock),
        config.executor.clone(),
    ));

    let dispatcher = Dispatcher::new(executor.clone(), config.dispatcher.clone())?;
    dispatcher.start().await?;

    info!(
        worker_id = %dispatcher.worker_id(),
        pool_size = config.dispatcher.pool_size,
        "Dispatcher running"
    );

    for n in 0..config.demo_orders {
        let order = Order {
            order_id: format!("demo-{}", Uuid::now_v7()),
            sku: "BOOK-1".to_string(),
            quantity: 1 + n % 3,
            amount_cents: 1_500 * u64::from(1 + n % 4),
        };
        let id = executor.start(SHIP_ORDER, Payload::encode(&order)?).await?;
        info!(instance_id = %id, order_id = %order.order_id, "Started demo order");
    }

    shutdown.await;
    info!("Shutting down dispatcher");
    dispatcher.shutdown().await?;
    Ok(())
}
