//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via the instance `version` column
//! - Concurrent claiming with `FOR UPDATE SKIP LOCKED`
//! - Append-only step history keyed by (instance, run, step, attempt)
//! - Short transactions where a write spans rows: re-runs and signals

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::payload::{ErrorInfo, Payload};

/// Schema expected by [`PostgresWorkflowStore`]
///
/// Hosts apply it with their own migration flow or call
/// `MIGRATOR.run(&pool)` once at startup.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool supplied by the host.
///
/// # Example
///
/// ```ignore
/// use stepwise_durable::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a conditional write matched no row
    ///
    /// `target` is the state the write tried to move to; with a matching
    /// version the lifecycle must have refused the transition.
    async fn explain_rejected(
        &self,
        instance_id: Uuid,
        expected: i64,
        target: Option<InstanceState>,
    ) -> StoreError {
        let row = sqlx::query("SELECT version, state FROM workflow_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => {
                let actual: i64 = row.get("version");
                let state = row.get::<String, _>("state").parse::<InstanceState>();
                match (target, state) {
                    (Some(to), Ok(from)) if actual == expected => StoreError::InvalidTransition {
                        instance_id,
                        from,
                        to,
                    },
                    _ => StoreError::ConcurrencyConflict {
                        instance_id,
                        expected,
                        actual,
                    },
                }
            }
            Ok(None) => StoreError::InstanceNotFound(instance_id),
            Err(e) => map_sqlx_error("load instance version", e),
        }
    }

    /// Park an instance on a signal, or make it due if the signal is already here
    ///
    /// The row lock orders this against `deliver_signal`, so a signal is
    /// either seen here or delivered to the parked row, never missed.
    async fn update_awaiting_signal(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        update: &InstanceUpdate,
        signal: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;

        let current = sqlx::query("SELECT * FROM workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock instance", e))?
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        let current = instance_from_row(&current)?;
        if current.version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                instance_id,
                expected: expected_version,
                actual: current.version,
            });
        }
        current.state.ensure_transition(instance_id, update.state)?;

        let signalled: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM workflow_signals
                WHERE instance_id = $1 AND run = $2 AND name = $3
            )
            "#,
        )
        .bind(instance_id)
        .bind(to_db_int("run", current.run)?)
        .bind(signal)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("look up signal", e))?;

        let next_wake_at = if signalled { Some(now) } else { update.next_wake_at };
        let row = apply_update(&mut *tx, instance_id, expected_version, update, next_wake_at, now)
            .await?
            .ok_or_else(|| StoreError::Database("locked instance row not updated".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit signal wait", e))?;
        instance_from_row(&row)
    }
}

/// Classify a sqlx error
///
/// Connectivity failures become `Unavailable` so callers back off instead of
/// treating them as data errors.
fn map_sqlx_error(context: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            warn!("Persistence unavailable during {}: {}", context, e);
            StoreError::Unavailable(e.to_string())
        }
        _ => {
            error!("Failed to {}: {}", context, e);
            StoreError::Database(e.to_string())
        }
    }
}

fn to_json_error(e: crate::payload::PayloadError) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn error_to_json(error: Option<&ErrorInfo>) -> Result<Option<serde_json::Value>, StoreError> {
    error.map(|e| e.to_value().map_err(to_json_error)).transpose()
}

fn error_from_json(value: Option<serde_json::Value>) -> Result<Option<ErrorInfo>, StoreError> {
    value
        .map(|v| ErrorInfo::from_value(v).map_err(to_json_error))
        .transpose()
}

fn from_db_int(column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{} out of range: {}", column, value)))
}

fn to_db_int(column: &str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{} out of range: {}", column, value)))
}

fn column_u32(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    from_db_int(column, row.get::<i32, _>(column))
}

/// Text values a write moving to `next` may start from
fn source_states(next: InstanceState) -> Vec<String> {
    InstanceState::sources_of(next)
        .into_iter()
        .map(|state| state.as_str().to_string())
        .collect()
}

fn instance_from_row(row: &PgRow) -> Result<InstanceRecord, StoreError> {
    let state: String = row.get("state");
    let lease_owner: Option<String> = row.get("lease_owner");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");

    Ok(InstanceRecord {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        state: state.parse()?,
        input: Payload::new(row.get("input")),
        result: row
            .get::<Option<serde_json::Value>, _>("result")
            .map(Payload::new),
        error: error_from_json(row.get("error"))?,
        version: row.get("version"),
        run: column_u32(row, "run")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        next_wake_at: row.get("next_wake_at"),
        awaiting_signal: row.get("awaiting_signal"),
        lease: lease_owner
            .zip(lease_expires_at)
            .map(|(owner, expires_at)| Lease { owner, expires_at }),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord, StoreError> {
    let status: String = row.get("status");

    Ok(StepRecord {
        instance_id: row.get("instance_id"),
        run: column_u32(row, "run")?,
        step_index: column_u32(row, "step_index")?,
        step_name: row.get("step_name"),
        attempt: column_u32(row, "attempt")?,
        status: status.parse()?,
        input: Payload::new(row.get("input")),
        output: row
            .get::<Option<serde_json::Value>, _>("output")
            .map(Payload::new),
        error: error_from_json(row.get("error"))?,
        worker_id: row.get("worker_id"),
        scheduled_at: row.get("scheduled_at"),
        completed_at: row.get("completed_at"),
        retry_at: row.get("retry_at"),
    })
}

fn signal_from_row(row: &PgRow) -> Result<Signal, StoreError> {
    Ok(Signal {
        instance_id: row.get("instance_id"),
        run: column_u32(row, "run")?,
        name: row.get("name"),
        payload: Payload::new(row.get("payload")),
        received_at: row.get("received_at"),
    })
}

/// Version- and lifecycle-checked UPDATE; `None` when no row matched
async fn apply_update<'e, E: PgExecutor<'e>>(
    executor: E,
    instance_id: Uuid,
    expected_version: i64,
    update: &InstanceUpdate,
    next_wake_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<PgRow>, StoreError> {
    let error_json = error_to_json(update.error.as_ref())?;

    sqlx::query(
        r#"
        UPDATE workflow_instances
        SET state = $3,
            next_wake_at = $4,
            result = $5,
            error = $6,
            awaiting_signal = $7,
            lease_owner = CASE WHEN $8 THEN NULL ELSE lease_owner END,
            lease_expires_at = CASE WHEN $8 THEN NULL ELSE lease_expires_at END,
            version = version + 1,
            updated_at = $9
        WHERE id = $1 AND version = $2 AND state = ANY($10)
        RETURNING *
        "#,
    )
    .bind(instance_id)
    .bind(expected_version)
    .bind(update.state.as_str())
    .bind(next_wake_at)
    .bind(update.result.as_ref().map(Payload::as_value))
    .bind(error_json)
    .bind(update.awaiting_signal.as_deref())
    .bind(update.release_lease)
    .bind(now)
    .bind(source_states(update.state))
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("update instance", e))
}

async fn insert_step<'e, E: PgExecutor<'e>>(executor: E, record: &StepRecord) -> Result<(), StoreError> {
    let error_json = error_to_json(record.error.as_ref())?;

    let result = sqlx::query(
        r#"
        INSERT INTO step_executions
            (instance_id, run, step_index, step_name, attempt, status,
             input, output, error, worker_id, scheduled_at, completed_at, retry_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(record.instance_id)
    .bind(to_db_int("run", record.run)?)
    .bind(to_db_int("step_index", record.step_index)?)
    .bind(&record.step_name)
    .bind(to_db_int("attempt", record.attempt)?)
    .bind(record.status.as_str())
    .bind(record.input.as_value())
    .bind(record.output.as_ref().map(Payload::as_value))
    .bind(error_json)
    .bind(&record.worker_id)
    .bind(record.scheduled_at)
    .bind(record.completed_at)
    .bind(record.retry_at)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::DuplicateAttempt {
                instance_id: record.instance_id,
                run: record.run,
                step_index: record.step_index,
                attempt: record.attempt,
            })
        }
        Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
            Err(StoreError::InstanceNotFound(record.instance_id))
        }
        Err(e) => Err(map_sqlx_error("append step attempt", e)),
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn create_instance(
        &self,
        instance: NewInstance,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, workflow_type, state, input, version, run, created_at, updated_at, next_wake_at)
            VALUES ($1, $2, 'created', $3, 0, 1, $4, $4, $4)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(instance.id)
        .bind(&instance.workflow_type)
        .bind(instance.input.as_value())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create instance", e))?
        .ok_or(StoreError::InstanceAlreadyExists(instance.id))?;

        debug!(instance_id = %instance.id, workflow_type = %instance.workflow_type, "created instance");
        instance_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get instance", e))?
            .ok_or(StoreError::InstanceNotFound(instance_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self, update), fields(state = %update.state))]
    async fn update_instance(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        update: InstanceUpdate,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        if let Some(signal) = update.awaiting_signal.as_deref() {
            let record = self
                .update_awaiting_signal(instance_id, expected_version, &update, signal, now)
                .await?;
            debug!(%instance_id, version = record.version, signal, "instance awaiting signal");
            return Ok(record);
        }

        let row = apply_update(
            &self.pool,
            instance_id,
            expected_version,
            &update,
            update.next_wake_at,
            now,
        )
        .await?;

        match row {
            Some(row) => {
                debug!(%instance_id, version = expected_version + 1, "updated instance");
                instance_from_row(&row)
            }
            None => Err(self
                .explain_rejected(instance_id, expected_version, Some(update.state))
                .await),
        }
    }

    #[instrument(skip(self, carried), fields(carried = carried.len()))]
    async fn reopen_instance(
        &self,
        instance_id: Uuid,
        expected_version: i64,
        carried: Vec<StepRecord>,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = 'created',
                run = run + 1,
                next_wake_at = $3,
                result = NULL,
                error = NULL,
                awaiting_signal = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                version = version + 1,
                updated_at = $3
            WHERE id = $1 AND version = $2 AND state = ANY($4)
            RETURNING *
            "#,
        )
        .bind(instance_id)
        .bind(expected_version)
        .bind(now)
        .bind(source_states(InstanceState::Created))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reopen instance", e))?;

        let Some(row) = row else {
            drop(tx);
            return Err(self
                .explain_rejected(instance_id, expected_version, Some(InstanceState::Created))
                .await);
        };
        let reopened = instance_from_row(&row)?;

        for record in carried {
            let record = StepRecord {
                instance_id,
                run: reopened.run,
                ..record
            };
            insert_step(&mut *tx, &record).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit reopen", e))?;
        debug!(%instance_id, run = reopened.run, "reopened instance");
        Ok(reopened)
    }

    #[instrument(skip(self))]
    async fn cancel_instance(
        &self,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = 'cancelled',
                next_wake_at = NULL,
                awaiting_signal = NULL,
                version = version + 1,
                updated_at = $2
            WHERE id = $1
              AND state NOT IN ('completed', 'failed', 'cancelled')
            RETURNING version
            "#,
        )
        .bind(instance_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel instance", e))?;

        if let Some(row) = row {
            debug!(%instance_id, "cancelled instance");
            return Ok(CancelOutcome::Cancelled {
                version: row.get("version"),
            });
        }

        let current = self.get_instance(instance_id).await?;
        Ok(CancelOutcome::AlreadyTerminal(current.state))
    }

    #[instrument(skip(self))]
    async fn claim_due_work(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<ClaimedInstance>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let expires_at = now + to_time_delta(lease_duration)?;

        // SKIP LOCKED keeps concurrent claimers off each other's rows; the
        // lease predicate keeps them off rows another claimer already owns.
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id, state AS previous_state
                FROM workflow_instances
                WHERE state IN ('created', 'running', 'waiting')
                  AND next_wake_at <= $1
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
                ORDER BY next_wake_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_instances w
            SET state = 'running',
                lease_owner = $3,
                lease_expires_at = $4,
                version = w.version + 1,
                updated_at = $1
            FROM due d
            WHERE w.id = d.id
            RETURNING w.*, d.previous_state
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(owner)
        .bind(expires_at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim due work", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let previous_state: String = row.get("previous_state");
            claimed.push(ClaimedInstance {
                instance: instance_from_row(&row)?,
                previous_state: previous_state.parse()?,
            });
        }

        if !claimed.is_empty() {
            debug!(owner, count = claimed.len(), "claimed instances");
        }

        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        instance_id: Uuid,
        owner: &str,
        expected_version: i64,
        now: DateTime<Utc>,
        extension: Duration,
    ) -> Result<LeaseGrant, StoreError> {
        let expires_at = now + to_time_delta(extension)?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_expires_at = $4,
                version = version + 1,
                updated_at = $5
            WHERE id = $1 AND version = $2 AND lease_owner = $3
            RETURNING version, lease_expires_at
            "#,
        )
        .bind(instance_id)
        .bind(expected_version)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew lease", e))?;

        match row {
            Some(row) => Ok(LeaseGrant {
                version: row.get("version"),
                expires_at: row.get("lease_expires_at"),
            }),
            None => Err(self.explain_rejected(instance_id, expected_version, None).await),
        }
    }

    #[instrument(skip(self))]
    async fn release_lease(
        &self,
        instance_id: Uuid,
        owner: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_owner = NULL,
                lease_expires_at = NULL,
                version = version + 1,
                updated_at = $4
            WHERE id = $1 AND version = $2 AND lease_owner = $3
            RETURNING version
            "#,
        )
        .bind(instance_id)
        .bind(expected_version)
        .bind(owner)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release lease", e))?;

        match row {
            Some(row) => Ok(row.get("version")),
            None => Err(self.explain_rejected(instance_id, expected_version, None).await),
        }
    }

    #[instrument(skip(self, record), fields(instance_id = %record.instance_id, step = %record.step_name, attempt = record.attempt))]
    async fn append_step_attempt(&self, record: StepRecord) -> Result<(), StoreError> {
        insert_step(&self.pool, &record).await?;
        debug!(status = %record.status, "recorded step attempt");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        // Distinguish "no history yet" from "no such instance"
        self.get_instance(instance_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT *
            FROM step_executions
            WHERE instance_id = $1
            ORDER BY run, step_index, attempt
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load steps", e))?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, payload))]
    async fn deliver_signal(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<SignalDelivery, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin transaction", e))?;

        let row = sqlx::query(
            "SELECT run, state, awaiting_signal FROM workflow_instances WHERE id = $1 FOR UPDATE",
        )
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock instance", e))?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        let state: InstanceState = row.get::<String, _>("state").parse()?;
        if state.is_terminal() {
            return Ok(SignalDelivery::AlreadyTerminal(state));
        }
        let run = column_u32(&row, "run")?;
        let awaiting: Option<String> = row.get("awaiting_signal");

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_signals (instance_id, run, name, payload, received_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id, run, name) DO NOTHING
            "#,
        )
        .bind(instance_id)
        .bind(to_db_int("run", run)?)
        .bind(name)
        .bind(payload.as_value())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert signal", e))?
        .rows_affected();
        if inserted == 0 {
            return Ok(SignalDelivery::AlreadyDelivered);
        }

        let woke = state == InstanceState::Waiting && awaiting.as_deref() == Some(name);
        if woke {
            sqlx::query(
                r#"
                UPDATE workflow_instances
                SET next_wake_at = $2,
                    version = version + 1,
                    updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(instance_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("wake instance", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit signal", e))?;
        debug!(%instance_id, run, woke, "delivered signal");
        Ok(SignalDelivery::Delivered { run, woke })
    }

    #[instrument(skip(self))]
    async fn get_signal(
        &self,
        instance_id: Uuid,
        run: u32,
        name: &str,
    ) -> Result<Option<Signal>, StoreError> {
        self.get_instance(instance_id).await?;

        let row = sqlx::query(
            "SELECT * FROM workflow_signals WHERE instance_id = $1 AND run = $2 AND name = $3",
        )
        .bind(instance_id)
        .bind(to_db_int("run", run)?)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get signal", e))?;

        row.as_ref().map(signal_from_row).transpose()
    }
}
