//! Per-vault lease management.
//!
//! One lease key per (vault, load class): the INCR/FULL consumer leases
//! `<vault>` and the independent LOG consumer leases `<vault>#log`. The
//! keeper renews at half-TTL and exposes a [`CommitGate`] so the apply
//! engine can verify ownership immediately before COMMIT.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use lode_apply::CommitGate;
use lode_store_core::{ControlPlaneStore, StoreError, StoreResult};

/// An acquired lease, renewed while work is in flight.
///
/// Release is explicit on every exit path; nothing happens at drop time.
/// A keeper that is never released simply expires after its TTL.
pub struct LeaseKeeper {
    store: Arc<dyn ControlPlaneStore>,
    key: String,
    owner: String,
    ttl: Duration,
    renewed_at: Instant,
}

impl LeaseKeeper {
    /// Try to acquire `key`. Returns `None` when another live owner holds
    /// it (not an error: some other runner is doing the work).
    pub async fn acquire(
        store: Arc<dyn ControlPlaneStore>,
        key: String,
        ttl: Duration,
    ) -> StoreResult<Option<Self>> {
        let owner = Uuid::new_v4().to_string();
        match store.acquire_lease(&key, &owner, ttl).await {
            Ok(_) => {
                debug!(lease = %key, %owner, "lease acquired");
                Ok(Some(Self {
                    store,
                    key,
                    owner,
                    ttl,
                    renewed_at: Instant::now(),
                }))
            }
            Err(StoreError::PreconditionFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The opaque owner token of this acquisition.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Renew when at least half the TTL has elapsed. Returns `false` when
    /// the lease expired or changed hands; the caller must stop.
    pub async fn renew_if_due(&mut self) -> bool {
        if self.renewed_at.elapsed() < self.ttl / 2 {
            return true;
        }
        match self
            .store
            .renew_lease(&self.key, &self.owner, self.ttl)
            .await
        {
            Ok(_) => {
                self.renewed_at = Instant::now();
                true
            }
            Err(e) => {
                warn!(lease = %self.key, error = %e, "lease renewal failed");
                false
            }
        }
    }

    /// A commit gate bound to this acquisition.
    pub fn gate(&self) -> LeaseGate {
        LeaseGate {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            owner: self.owner.clone(),
        }
    }

    /// Release the lease. Failures are logged, not propagated: the lease
    /// expires on its own either way.
    pub async fn release(self) {
        if let Err(e) = self.store.release_lease(&self.key, &self.owner).await {
            warn!(lease = %self.key, error = %e, "lease release failed");
        }
    }
}

/// Commit gate that checks the lease is still held by this owner.
pub struct LeaseGate {
    store: Arc<dyn ControlPlaneStore>,
    key: String,
    owner: String,
}

#[async_trait]
impl CommitGate for LeaseGate {
    async fn may_commit(&self) -> bool {
        match self.store.get_lease(&self.key).await {
            Ok(Some(lease)) => lease.owner == self.owner && !lease.is_expired(Utc::now()),
            Ok(None) => false,
            Err(e) => {
                warn!(lease = %self.key, error = %e, "lease check failed, refusing commit");
                false
            }
        }
    }
}
