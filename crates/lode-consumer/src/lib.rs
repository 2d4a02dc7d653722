#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-consumer** – Consumer orchestrator for the Lode control plane.
//!
//! One invocation drives one vault: acquire the per-vault lease, select
//! the earliest eligible window under the ordering rules, claim it with a
//! conditional write, run the apply engine, advance the watermark on
//! commit, and loop until the queue is drained or blocked. All durable
//! state lives in the control-plane store, so the consumer is re-entrant:
//! a crash at any point is recovered by the next invocation.
//!
//! Single-flight per vault is the conjunction of the lease and the
//! `READY → PROCESSING` conditional write; losing either stops the run.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use lode_apply::{ApplyEngine, ApplyError, ApplyRequest};
use lode_store_core::{
    with_retries, Alert, ChangeEvent, ControlPlaneStore, EntryUpdate, RetryPolicy, Severity,
    StoreError,
};
use lode_types::{
    incr_lease_key, log_lease_key, EntryStatus, LoadType, LodeConfig, QueueEntry, VaultId,
    VaultMode, VaultState,
};

pub mod daemon;
pub mod lease;
pub mod ops;

pub use daemon::run_daemon;
pub use lease::{LeaseGate, LeaseKeeper};
pub use ops::{reset_failed, trigger_full, TriggerError, TriggerReport};

//─────────────────────────────
//  Configuration and outcomes
//─────────────────────────────

/// Consumer-side configuration, derived from [`LodeConfig`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Tenant this consumer serves.
    pub vault: VaultId,
    /// Which queue this instance drains: `Incr` (also handles FULL via the
    /// vault mode) or `Log` (independent lease and watermark).
    pub load_class: LoadType,
    /// Lease TTL; sized to the maximum apply time plus slack.
    pub lease_ttl: Duration,
    /// Claims allowed before a crashed PROCESSING entry needs an operator.
    pub max_attempts: u32,
    /// Queue page size per selection scan.
    pub scan_limit: usize,
}

impl ConsumerConfig {
    /// Derive from process configuration.
    pub fn from_config(config: &LodeConfig) -> Result<Self, String> {
        let load_class = match config.extract_type {
            LoadType::Log => LoadType::Log,
            LoadType::Incr | LoadType::Full => LoadType::Incr,
        };
        Ok(Self {
            vault: VaultId::new(config.vault_id.clone())?,
            load_class,
            lease_ttl: config.lease_ttl,
            max_attempts: config.max_attempts,
            scan_limit: 64,
        })
    }
}

/// Terminal state of one consumer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No eligible window remains; `applied` windows were committed.
    Drained {
        /// Windows committed during this invocation.
        applied: usize,
    },
    /// Another runner holds the lease; nothing to do.
    AnotherOwner,
    /// The queue is logically paused (failed entry, stuck PROCESSING,
    /// lost lease, epoch moved). Resumes via operator action or TTL.
    Blocked {
        /// Human-readable pause reason.
        reason: String,
    },
    /// A window failed; the entry is FAILED and an alert was emitted.
    Failed {
        /// Sort key of the failed entry.
        sort_key: String,
        /// The apply error.
        error: String,
        /// Whether the failure is a protocol error.
        protocol: bool,
    },
}

/// Errors that abort a consumer invocation outright.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Control-plane store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The vault has no state row yet.
    #[error("vault {0} has no state; run the producer first")]
    UninitializedVault(VaultId),
}

enum Selection {
    Claim(QueueEntry),
    Retry,
    Stop(String),
    Empty,
}

//─────────────────────────────
//  Consumer
//─────────────────────────────

/// Drives one vault's queue against the warehouse.
pub struct Consumer {
    store: Arc<dyn ControlPlaneStore>,
    engine: ApplyEngine,
    alert: Arc<dyn Alert>,
    retry: RetryPolicy,
    config: ConsumerConfig,
}

impl Consumer {
    /// Build a consumer over its collaborators.
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        engine: ApplyEngine,
        alert: Arc<dyn Alert>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            alert,
            retry: RetryPolicy::default(),
            config,
        }
    }

    /// The control-plane store this consumer watches.
    pub fn store(&self) -> &Arc<dyn ControlPlaneStore> {
        &self.store
    }

    /// Whether a change event concerns this consumer's vault.
    pub fn is_relevant(&self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::EntryRegistered { vault_id, .. }
            | ChangeEvent::EntryUpdated { vault_id, .. }
            | ChangeEvent::VaultStateChanged { vault_id } => *vault_id == self.config.vault,
        }
    }

    /// Run one full drive loop: acquire the lease, drain until blocked or
    /// empty, release.
    pub async fn run_once(&self) -> Result<Outcome, ConsumerError> {
        let lease_key = match self.config.load_class {
            LoadType::Log => log_lease_key(&self.config.vault),
            LoadType::Incr | LoadType::Full => incr_lease_key(&self.config.vault),
        };
        let Some(mut lease) = LeaseKeeper::acquire(
            Arc::clone(&self.store),
            lease_key,
            self.config.lease_ttl,
        )
        .await?
        else {
            debug!(vault = %self.config.vault, "another runner owns the lease");
            return Ok(Outcome::AnotherOwner);
        };

        let outcome = self.drive(&mut lease).await;
        lease.release().await;
        outcome
    }

    async fn drive(&self, lease: &mut LeaseKeeper) -> Result<Outcome, ConsumerError> {
        let mut applied = 0usize;
        loop {
            if !lease.renew_if_due().await {
                return Ok(Outcome::Blocked {
                    reason: "lease lost between windows".to_string(),
                });
            }

            let Some(state) = self.store.get_vault_state(&self.config.vault).await? else {
                return Err(ConsumerError::UninitializedVault(self.config.vault.clone()));
            };

            // FULL supersedes both queues; the LOG consumer waits it out.
            if state.mode == VaultMode::FullLoad && self.config.load_class == LoadType::Log {
                return Ok(Outcome::Blocked {
                    reason: "full load in progress".to_string(),
                });
            }
            let load_type = match state.mode {
                VaultMode::FullLoad => LoadType::Full,
                VaultMode::Incremental => self.config.load_class,
            };

            match self.select(&state, load_type).await? {
                Selection::Retry => continue,
                Selection::Empty => return Ok(Outcome::Drained { applied }),
                Selection::Stop(reason) => {
                    debug!(vault = %self.config.vault, %reason, "queue blocked");
                    return Ok(Outcome::Blocked { reason });
                }
                Selection::Claim(entry) => {
                    match self.claim_and_apply(load_type, entry, lease).await? {
                        Step::Applied => applied += 1,
                        Step::LostClaimRace => {}
                        Step::Terminal(outcome) => return Ok(outcome),
                    }
                }
            }
        }
    }

    /// The selection rule: earliest entry after the watermark whose epoch
    /// is current decides what happens next.
    async fn select(
        &self,
        state: &VaultState,
        load_type: LoadType,
    ) -> Result<Selection, ConsumerError> {
        let watermark = match load_type {
            LoadType::Log => state.log_watermark,
            LoadType::Incr => state.last_applied_stoptime,
            // The FULL window sits exactly at the rewound watermark, so an
            // after-the-watermark scan would miss it; scan from the start
            // and let the epoch and status filters select it.
            LoadType::Full => None,
        };
        let entries = with_retries(&self.retry, "scan queue", || {
            self.store.scan_forward(
                &self.config.vault,
                load_type,
                watermark,
                self.config.scan_limit,
            )
        })
        .await?;

        for entry in entries {
            if entry.epoch != state.current_epoch {
                debug!(sort_key = %entry.sort_key(), entry_epoch = %entry.epoch, "skipping stale-epoch entry");
                continue;
            }
            match entry.status {
                // Should not occur after the watermark filter; defensive.
                EntryStatus::Applied => continue,
                EntryStatus::Ready => return Ok(Selection::Claim(entry)),
                EntryStatus::Processing => {
                    // We hold the vault lease, so the claimer of this entry
                    // is gone and its lease has expired.
                    if entry.attempt_count < self.config.max_attempts {
                        let sort_key = entry.sort_key();
                        match self
                            .store
                            .conditional_update(
                                &self.config.vault,
                                &sort_key,
                                EntryStatus::Processing,
                                EntryUpdate::to(EntryStatus::Ready),
                            )
                            .await
                        {
                            Ok(_) => {
                                info!(%sort_key, "recovered orphaned PROCESSING entry to READY");
                                return Ok(Selection::Retry);
                            }
                            Err(StoreError::PreconditionFailed(_)) => {
                                return Ok(Selection::Retry)
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    return Ok(Selection::Stop(format!(
                        "entry {} stuck PROCESSING after {} attempts; operator reset required",
                        entry.sort_key(),
                        entry.attempt_count
                    )));
                }
                EntryStatus::Failed => {
                    return Ok(Selection::Stop(format!(
                        "blocked by FAILED entry {}",
                        entry.sort_key()
                    )))
                }
            }
        }
        Ok(Selection::Empty)
    }

    async fn claim_and_apply(
        &self,
        load_type: LoadType,
        entry: QueueEntry,
        lease: &mut LeaseKeeper,
    ) -> Result<Step, ConsumerError> {
        let sort_key = entry.sort_key();
        let claimed = match self
            .store
            .conditional_update(
                &self.config.vault,
                &sort_key,
                EntryStatus::Ready,
                EntryUpdate::to(EntryStatus::Processing).bumping_attempts(),
            )
            .await
        {
            Ok(claimed) => claimed,
            // Another runner won the claim; re-enter selection.
            Err(StoreError::PreconditionFailed(_)) => return Ok(Step::LostClaimRace),
            Err(e) => return Err(e.into()),
        };
        info!(
            vault = %self.config.vault,
            %sort_key,
            attempt = claimed.attempt_count,
            "claimed window"
        );

        let request = ApplyRequest {
            vault: self.config.vault.clone(),
            load_type: claimed.load_type,
            logical_time: claimed.logical_time,
            epoch: claimed.epoch,
            staging_prefix: claimed.staging_prefix.clone(),
        };
        let gate = lease.gate();
        match self.engine.apply(&request, &gate).await {
            Ok(outcome) => {
                self.store
                    .conditional_update(
                        &self.config.vault,
                        &sort_key,
                        EntryStatus::Processing,
                        EntryUpdate::to(EntryStatus::Applied),
                    )
                    .await?;
                debug!(%sort_key, rows = outcome.rows_loaded, "window applied");
                self.advance_watermark(load_type, &claimed).await
            }
            Err(ApplyError::LeaseLost) => {
                // The entry stays PROCESSING; TTL expiry hands it to the
                // next runner.
                Ok(Step::Terminal(Outcome::Blocked {
                    reason: format!("lease lost while applying {sort_key}"),
                }))
            }
            Err(err) => {
                let protocol = err.is_protocol();
                let error = err.to_string();
                self.store
                    .conditional_update(
                        &self.config.vault,
                        &sort_key,
                        EntryStatus::Processing,
                        EntryUpdate::to(EntryStatus::Failed).with_error(error.clone()),
                    )
                    .await?;
                self.alert
                    .fire(
                        Severity::Error,
                        "window apply failed",
                        &format!("{sort_key}: {error}"),
                    )
                    .await;
                warn!(vault = %self.config.vault, %sort_key, %error, "window failed");
                Ok(Step::Terminal(Outcome::Failed {
                    sort_key,
                    error,
                    protocol,
                }))
            }
        }
    }

    /// Advance the watermark for a committed window, guarded by the epoch
    /// the entry was claimed under.
    async fn advance_watermark(
        &self,
        load_type: LoadType,
        claimed: &QueueEntry,
    ) -> Result<Step, ConsumerError> {
        let Some(current) = self.store.get_vault_state(&self.config.vault).await? else {
            return Err(ConsumerError::UninitializedVault(self.config.vault.clone()));
        };
        if current.current_epoch != claimed.epoch {
            return Ok(Step::Terminal(Outcome::Blocked {
                reason: "epoch changed during apply".to_string(),
            }));
        }
        let mut next = current;
        match load_type {
            LoadType::Log => next.log_watermark = Some(claimed.logical_time),
            LoadType::Incr => next.last_applied_stoptime = Some(claimed.logical_time),
            LoadType::Full => {
                next.last_applied_stoptime = Some(claimed.logical_time);
                // The snapshot landed; hand the vault back to INCR.
                next.mode = VaultMode::Incremental;
            }
        }
        match self
            .store
            .update_vault_state(&self.config.vault, claimed.epoch, next)
            .await
        {
            Ok(()) => Ok(Step::Applied),
            Err(StoreError::PreconditionFailed(_)) => Ok(Step::Terminal(Outcome::Blocked {
                reason: "epoch changed during apply".to_string(),
            })),
            Err(e) => Err(e.into()),
        }
    }
}

enum Step {
    Applied,
    LostClaimRace,
    Terminal(Outcome),
}
