// Demo "ship-order" workflow
// Decision: Steps exchange typed structs encoded as payloads; each step decodes its predecessor's output
// Decision: The charge step passes the step idempotency key to the gateway so a retried attempt never double-charges

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use stepwise_durable::engine::{RegistryError, WorkflowDefinition, WorkflowRegistry};
use stepwise_durable::{Payload, RetryPolicy, Step, StepContext, StepError};

pub const SHIP_ORDER: &str = "ship-order";

/// Workflow input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub amount_cents: u64,
}

/// Output of `reserveInventory`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub order: Order,
    pub reservation_id: String,
}

/// Output of `charge`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub order: Order,
    pub reservation_id: String,
    pub charge_id: String,
}

/// Output of `notify`, and of the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub order_id: String,
    pub charge_id: String,
    pub notified: bool,
}

pub struct ReserveInventory;

#[async_trait]
impl Step for ReserveInventory {
    async fn execute(&self, ctx: &StepContext, input: Payload) -> Result<Payload, StepError> {
        let order: Order = input.decode()?;
        if order.quantity == 0 {
            return Err(StepError::fatal(format!("order {} has no items", order.order_id))
                .with_type("INVALID_ORDER"));
        }

        let reservation = Reservation {
            reservation_id: format!("res-{}", ctx.idempotency_key()),
            order,
        };
        Ok(Payload::encode(&reservation)?)
    }
}

/// Simulated payment gateway
pub struct ChargePayment {
    failure_rate: f64,
    limit_cents: u64,
}

impl ChargePayment {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            limit_cents: 1_000_000,
        }
    }

    pub fn with_limit_cents(mut self, limit: u64) -> Self {
        self.limit_cents = limit;
        self
    }
}

#[async_trait]
impl Step for ChargePayment {
    async fn execute(&self, ctx: &StepContext, input: Payload) -> Result<Payload, StepError> {
        let reservation: Reservation = input.decode()?;
        let order = reservation.order;

        if order.amount_cents > self.limit_cents {
            return Err(StepError::fatal(format!(
                "card declined for {} cents",
                order.amount_cents
            ))
            .with_type("DECLINED"));
        }

        if ctx.is_lease_lost() {
            return Err(StepError::retryable("lease lost before charging").with_type("LEASE_LOST"));
        }

        let timed_out = rand::thread_rng().gen_bool(self.failure_rate);
        if timed_out {
            warn!(order_id = %order.order_id, attempt = ctx.attempt, "Payment gateway timed out");
            return Err(StepError::retryable("payment gateway timeout").with_type("GATEWAY_TIMEOUT"));
        }

        let receipt = Receipt {
            charge_id: format!("ch-{}", ctx.idempotency_key()),
            reservation_id: reservation.reservation_id,
            order,
        };
        Ok(Payload::encode(&receipt)?)
    }
}

pub struct NotifyCustomer;

#[async_trait]
impl Step for NotifyCustomer {
    async fn execute(&self, _ctx: &StepContext, input: Payload) -> Result<Payload, StepError> {
        let receipt: Receipt = input.decode()?;
        info!(
            order_id = %receipt.order.order_id,
            charge_id = %receipt.charge_id,
            "Order shipped, customer notified"
        );

        Ok(Payload::encode(&Shipment {
            order_id: receipt.order.order_id,
            charge_id: receipt.charge_id,
            notified: true,
        })?)
    }
}

pub fn ship_order(charge: ChargePayment) -> Result<WorkflowDefinition, RegistryError> {
    WorkflowDefinition::builder(SHIP_ORDER)
        .step("reserveInventory", ReserveInventory)
        .step("charge", charge)
        .step_with_retry(
            "notify",
            NotifyCustomer,
            RetryPolicy::fixed(Duration::from_secs(5), 10),
        )
        .retry_policy(
            RetryPolicy::exponential()
                .with_max_attempts(5)
                .with_non_retryable_error("DECLINED"),
        )
        .build()
}

/// Every workflow this worker runs
pub fn registry(charge_failure_rate: f64) -> Result<WorkflowRegistry, RegistryError> {
    let mut registry = WorkflowRegistry::new();
    registry.register(ship_order(ChargePayment::new(charge_failure_rate))?)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stepwise_durable::engine::{TurnOutcome, WorkflowExecutor};
    use stepwise_durable::persistence::{InMemoryWorkflowStore, InstanceState, WorkflowStore};
    use stepwise_durable::worker::LeaseHandle;
    use stepwise_durable::{Clock, ManualClock};

    fn order(amount_cents: u64) -> Order {
        Order {
            order_id: "A-100".to_string(),
            sku: "BOOK-1".to_string(),
            quantity: 2,
            amount_cents,
        }
    }

    async fn run(charge: ChargePayment, input: Order) -> (WorkflowExecutor, uuid::Uuid, TurnOutcome) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let clock = ManualClock::new();
        let mut registry = WorkflowRegistry::new();
        registry.register(ship_order(charge).unwrap()).unwrap();
        let executor =
            WorkflowExecutor::new(store.clone(), Arc::new(registry), Arc::new(clock.clone()));

        let id = executor
            .start(SHIP_ORDER, Payload::encode(&input).unwrap())
            .await
            .unwrap();

        let outcome = loop {
            let claim = store
                .claim_due_work("worker-1", clock.now(), Duration::from_secs(30), 1)
                .await
                .unwrap()
                .remove(0);
            let lease = LeaseHandle::from_claim(&claim).unwrap();
            match executor.run_turn(&claim, &lease).await.unwrap() {
                TurnOutcome::Waiting { wake_at } => clock.set(wake_at),
                outcome => break outcome,
            }
        };
        (executor, id, outcome)
    }

    #[test]
    fn test_registry_contains_ship_order() {
        let registry = registry(0.0).unwrap();
        assert_eq!(registry.workflow_types(), vec![SHIP_ORDER]);
        assert_eq!(registry.get(SHIP_ORDER).unwrap().len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_order_ships() {
        let (executor, id, outcome) = run(ChargePayment::new(0.0), order(4_200)).await;
        assert_eq!(outcome, TurnOutcome::Completed);

        let status = executor.get_status(id).await.unwrap();
        let shipment: Shipment = status.result.unwrap().decode().unwrap();
        assert_eq!(shipment.order_id, "A-100");
        assert_eq!(shipment.charge_id, format!("ch-{}:1:1", id));
        assert!(shipment.notified);
    }

    #[test_log::test(tokio::test)]
    async fn test_declined_card_fails_without_retry() {
        let charge = ChargePayment::new(0.0).with_limit_cents(1_000);
        let (executor, id, outcome) = run(charge, order(4_200)).await;
        assert_eq!(outcome, TurnOutcome::Failed);

        let status = executor.get_status(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Failed);
        assert_eq!(status.error.unwrap().error_type.as_deref(), Some("DECLINED"));
        assert_eq!(executor.history(id).await.unwrap().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_gateway_timeouts_exhaust_retries() {
        let (executor, id, outcome) = run(ChargePayment::new(1.0), order(4_200)).await;
        assert_eq!(outcome, TurnOutcome::Failed);

        let charges = executor
            .history(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.step_name == "charge")
            .count();
        assert_eq!(charges, 5);
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_order_is_rejected() {
        let mut empty = order(100);
        empty.quantity = 0;
        let (executor, id, outcome) = run(ChargePayment::new(0.0), empty).await;
        assert_eq!(outcome, TurnOutcome::Failed);

        let error = executor.get_status(id).await.unwrap().error.unwrap();
        assert_eq!(error.error_type.as_deref(), Some("INVALID_ORDER"));
        assert_eq!(error.step_name.as_deref(), Some("reserveInventory"));
    }
}
