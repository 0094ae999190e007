//! Lease ownership and background renewal
//!
//! A [`LeaseHandle`] is the worker's view of one claimed instance: the owner
//! id, the last version it wrote, and the lease-loss signal shared with the
//! running step. Every write the worker makes while holding the lease goes
//! through the handle's version lock, so renewals and outcome writes never
//! race each other on the version column.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::persistence::{ClaimedInstance, LeaseGrant, StoreError, WorkflowStore};
use crate::step::LeaseSignal;

/// Worker-side handle on a held lease
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    instance_id: Uuid,
    owner: String,
    version: Arc<Mutex<i64>>,
    expires_at: Arc<SyncMutex<DateTime<Utc>>>,
    signal: LeaseSignal,
}

impl LeaseHandle {
    pub fn new(instance_id: Uuid, owner: impl Into<String>, version: i64, expires_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            owner: owner.into(),
            version: Arc::new(Mutex::new(version)),
            expires_at: Arc::new(SyncMutex::new(expires_at)),
            signal: LeaseSignal::new(),
        }
    }

    /// Handle for a freshly claimed instance
    ///
    /// Returns `None` if the claim carries no lease.
    pub fn from_claim(claim: &ClaimedInstance) -> Option<Self> {
        let lease = claim.instance.lease.as_ref()?;
        Some(Self::new(
            claim.instance.id,
            lease.owner.clone(),
            claim.instance.version,
            lease.expires_at,
        ))
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn signal(&self) -> &LeaseSignal {
        &self.signal
    }

    pub fn is_lost(&self) -> bool {
        self.signal.is_lost()
    }

    pub fn mark_lost(&self) {
        self.signal.mark_lost();
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.lock()
    }

    /// Last version written under this lease
    pub async fn version(&self) -> i64 {
        *self.version.lock().await
    }

    /// Exclusive access to the version for a conditional write
    pub(crate) async fn lock_version(&self) -> MutexGuard<'_, i64> {
        self.version.lock().await
    }

    /// Extend the lease to `now + extension`
    ///
    /// A conflict means the lease is gone (cancelled, or reclaimed after
    /// expiry) and marks it lost. Connectivity failures only mark it lost
    /// once the current expiry has passed.
    pub async fn renew(
        &self,
        store: &dyn WorkflowStore,
        now: DateTime<Utc>,
        extension: Duration,
    ) -> Result<LeaseGrant, StoreError> {
        let mut version = self.version.lock().await;
        match store
            .renew_lease(self.instance_id, &self.owner, *version, now, extension)
            .await
        {
            Ok(grant) => {
                *version = grant.version;
                *self.expires_at.lock() = grant.expires_at;
                Ok(grant)
            }
            Err(e) => {
                if e.is_conflict() || matches!(e, StoreError::InstanceNotFound(_)) {
                    self.mark_lost();
                } else if self.expires_at() <= now {
                    warn!(instance_id = %self.instance_id, "Lease expired while store unreachable");
                    self.mark_lost();
                }
                Err(e)
            }
        }
    }

    /// Give the lease up without changing the instance state
    pub async fn release(
        &self,
        store: &dyn WorkflowStore,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut version = self.version.lock().await;
        let released = store
            .release_lease(self.instance_id, &self.owner, *version, now)
            .await?;
        *version = released;
        Ok(())
    }
}

/// Background task renewing a lease while a step runs
pub struct LeaseKeeper {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Renew every `interval` by `lease_duration` until stopped or lost
    pub fn spawn(
        lease: LeaseHandle,
        store: Arc<dyn WorkflowStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        lease_duration: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match lease.renew(store.as_ref(), clock.now(), lease_duration).await {
                            Ok(grant) => {
                                debug!(
                                    instance_id = %lease.instance_id(),
                                    expires_at = %grant.expires_at,
                                    "Renewed lease"
                                );
                            }
                            Err(e) => {
                                warn!(instance_id = %lease.instance_id(), "Lease renewal failed: {}", e);
                            }
                        }
                        if lease.is_lost() {
                            warn!(instance_id = %lease.instance_id(), "Lease lost");
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }
        });

        Self { stop_tx, handle }
    }

    /// Stop renewing and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
