//! Operator operations: failed-entry reset and the full-load trigger.
//!
//! `trigger_full` is the rewind protocol. It cannot be a single atomic
//! batch against a single-item-CAS store, so every step is written to be
//! replayable: re-running the trigger after a partial failure converges
//! on the same final state.

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use lode_staging::{manifest_checksum, StagingStore, WindowPrefix};
use lode_store_core::{ControlPlaneStore, EntryUpdate, Registration, StoreError, StoreResult};
use lode_types::{
    EntryKey, EntryStatus, Epoch, LoadType, QueueEntry, StopTime, VaultId, VaultMode,
};

/// What the full-load trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerReport {
    /// Epoch the vault now runs under.
    pub new_epoch: Epoch,
    /// INCR entries rewound to READY under the new epoch.
    pub rewound: usize,
    /// Whether the FULL entry was registered (false when the snapshot is
    /// not staged yet; the FULL producer registers it later).
    pub full_registered: bool,
}

/// Errors produced by the full-load trigger.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    /// Control-plane store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Staging layer failure while probing for the staged snapshot.
    #[error("staging error: {0}")]
    Staging(String),
}

/// CAS a FAILED entry back to READY (same epoch), clearing its error.
pub async fn reset_failed(
    store: &dyn ControlPlaneStore,
    vault: &VaultId,
    load_type: LoadType,
    stoptime: StopTime,
) -> StoreResult<QueueEntry> {
    let key = EntryKey {
        vault_id: vault.clone(),
        load_type,
        logical_time: stoptime,
    };
    let entry = store
        .conditional_update(
            vault,
            &key.sort_key(),
            EntryStatus::Failed,
            EntryUpdate::to(EntryStatus::Ready),
        )
        .await?;
    info!(vault = %vault, sort_key = %key.sort_key(), "reset FAILED entry to READY");
    Ok(entry)
}

/// Trigger a full-snapshot load with boundary `snapshot_date`.
///
/// Steps: bump the epoch and flip the vault to FULL_LOAD with the
/// watermark rewound to the boundary; re-epoch every INCR entry past the
/// boundary back to READY; register the FULL entry if its snapshot is
/// already staged. Each step is idempotent, so the whole trigger may be
/// re-run after a partial failure.
pub async fn trigger_full(
    store: &dyn ControlPlaneStore,
    staging: &dyn StagingStore,
    vault: &VaultId,
    snapshot_date: NaiveDate,
) -> Result<TriggerReport, TriggerError> {
    let boundary = StopTime::from_date(snapshot_date);
    let state = store
        .get_vault_state(vault)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("vault state {vault}")))?;

    // (a)+(b) Bump the epoch and rewind the watermark; skipped when a
    // previous run of this trigger already did it (replay).
    let new_epoch = if state.mode == VaultMode::FullLoad
        && state.last_applied_stoptime == Some(boundary)
    {
        state.current_epoch
    } else {
        let mut next = state.clone();
        next.mode = VaultMode::FullLoad;
        next.current_epoch = state.current_epoch.next();
        next.last_applied_stoptime = Some(boundary);
        next.full_load_started_at = Some(Utc::now());
        store
            .update_vault_state(vault, state.current_epoch, next)
            .await?;
        state.current_epoch.next()
    };

    // (c) Rewind: every INCR entry past the boundary becomes READY under
    // the new epoch. Entries at or before the boundary are not disturbed.
    let mut rewound = 0usize;
    let mut cursor = Some(boundary);
    loop {
        let entries = store
            .scan_forward(vault, LoadType::Incr, cursor, 64)
            .await?;
        if entries.is_empty() {
            break;
        }
        cursor = Some(entries[entries.len() - 1].logical_time);
        for entry in entries {
            if entry.epoch == new_epoch && entry.status == EntryStatus::Ready {
                continue; // already rewound by a previous run
            }
            match entry.status {
                EntryStatus::Applied | EntryStatus::Ready | EntryStatus::Failed => {
                    let update = EntryUpdate::to(EntryStatus::Ready).with_epoch(new_epoch);
                    match store
                        .conditional_update(vault, &entry.sort_key(), entry.status, update)
                        .await
                    {
                        Ok(_) => rewound += 1,
                        // Changed concurrently; a replay converges on it.
                        Err(StoreError::PreconditionFailed(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                EntryStatus::Processing => {
                    warn!(
                        sort_key = %entry.sort_key(),
                        "entry is PROCESSING during full-load trigger; leaving it to finish under the old epoch"
                    );
                }
            }
        }
    }

    // (d) Register the FULL entry when its snapshot is already staged;
    // otherwise the FULL producer registers it under the new epoch.
    let window = WindowPrefix::new(vault.clone(), LoadType::Full, boundary);
    let full_registered = match staging
        .get(&window.manifest_key())
        .await
        .map_err(|e| TriggerError::Staging(e.to_string()))?
    {
        Some(manifest) => {
            let entry = QueueEntry::ready(
                vault.clone(),
                LoadType::Full,
                boundary,
                window.prefix(),
                manifest_checksum(&manifest),
                new_epoch,
            );
            let sort_key = entry.sort_key();
            match store.put_if_absent(entry).await? {
                Registration::Created => true,
                Registration::AlreadyRegistered => {
                    // Re-epoch an entry registered before the trigger so it
                    // is visible again.
                    match store.get_entry(vault, &sort_key).await? {
                        Some(existing)
                            if existing.epoch != new_epoch
                                && existing.status == EntryStatus::Ready =>
                        {
                            store
                                .conditional_update(
                                    vault,
                                    &sort_key,
                                    EntryStatus::Ready,
                                    EntryUpdate::to(EntryStatus::Ready).with_epoch(new_epoch),
                                )
                                .await?;
                        }
                        _ => {}
                    }
                    true
                }
            }
        }
        None => {
            info!(
                vault = %vault,
                date = %snapshot_date,
                "full snapshot not staged yet; the FULL producer will register it"
            );
            false
        }
    };

    info!(
        vault = %vault,
        epoch = %new_epoch,
        rewound,
        full_registered,
        "full load triggered"
    );
    Ok(TriggerReport {
        new_epoch,
        rewound,
        full_registered,
    })
}
