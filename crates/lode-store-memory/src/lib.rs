#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-store-memory** – In-memory control-plane store driver for Lode.
//!
//! This crate provides a fast, non-persistent store suitable for tests and
//! local development. All state is lost when the process terminates. The
//! queue lives in a `BTreeMap` keyed by `(vault_id, sort_key)` so ordered
//! range scans fall out of the map's iteration order, exactly as they do
//! from the sort key in a real range-partitioned store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use lode_store_core::{
    ChangeEvent, ControlPlaneStore, EntryUpdate, Registration, StoreError, StoreResult,
};
use lode_types::{
    EntryStatus, Epoch, Lease, LoadType, QueueEntry, StopTime, VaultId, VaultState,
};

/// Default buffer size for the change-stream broadcast channel.
const DEFAULT_BUFFER: usize = 1024;

/// An in-memory, non-persistent control-plane store.
///
/// Mutations take the single write lock, so every operation observes and
/// produces a consistent snapshot; this is the same atomicity a
/// conditional-write store gives per item, strengthened to the whole map
/// (strictly more than the contract requires, never less).
#[derive(Debug, Clone)]
pub struct MemoryStore {
    queue: Arc<RwLock<BTreeMap<(VaultId, String), QueueEntry>>>,
    states: Arc<RwLock<HashMap<VaultId, VaultState>>>,
    leases: Arc<RwLock<HashMap<String, Lease>>>,
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default change-stream buffer.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Create an empty store with a custom change-stream buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (change_tx, _) = broadcast::channel(buffer_size);
        Self {
            queue: Arc::new(RwLock::new(BTreeMap::new())),
            states: Arc::new(RwLock::new(HashMap::new())),
            leases: Arc::new(RwLock::new(HashMap::new())),
            change_tx,
        }
    }

    /// Number of queue entries across all vaults.
    pub async fn entry_count(&self) -> usize {
        self.queue.read().await.len()
    }

    fn emit(&self, event: ChangeEvent) {
        // Ignore errors if no subscribers are listening
        let _ = self.change_tx.send(event);
    }
}

#[async_trait]
impl ControlPlaneStore for MemoryStore {
    async fn put_if_absent(&self, entry: QueueEntry) -> StoreResult<Registration> {
        let key = (entry.vault_id.clone(), entry.sort_key());
        let mut queue = self.queue.write().await;
        if let Some(existing) = queue.get(&key) {
            if existing.checksum == entry.checksum {
                return Ok(Registration::AlreadyRegistered);
            }
            return Err(StoreError::ChecksumMismatch {
                key: key.1,
                stored: existing.checksum.clone(),
                offered: entry.checksum,
            });
        }
        let event = ChangeEvent::EntryRegistered {
            vault_id: entry.vault_id.clone(),
            sort_key: key.1.clone(),
        };
        queue.insert(key, entry);
        drop(queue);
        self.emit(event);
        Ok(Registration::Created)
    }

    async fn get_entry(
        &self,
        vault: &VaultId,
        sort_key: &str,
    ) -> StoreResult<Option<QueueEntry>> {
        let key = (vault.clone(), sort_key.to_string());
        Ok(self.queue.read().await.get(&key).cloned())
    }

    async fn conditional_update(
        &self,
        vault: &VaultId,
        sort_key: &str,
        expected: EntryStatus,
        update: EntryUpdate,
    ) -> StoreResult<QueueEntry> {
        let key = (vault.clone(), sort_key.to_string());
        let mut queue = self.queue.write().await;
        let entry = queue
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("entry {sort_key}")))?;
        if entry.status != expected {
            return Err(StoreError::PreconditionFailed(format!(
                "entry {sort_key} is {}, expected {expected}",
                entry.status
            )));
        }
        entry.status = update.status;
        entry.last_error = update.last_error;
        if update.bump_attempts {
            entry.attempt_count += 1;
        }
        if let Some(epoch) = update.epoch {
            entry.epoch = epoch;
        }
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        drop(queue);
        self.emit(ChangeEvent::EntryUpdated {
            vault_id: vault.clone(),
            sort_key: sort_key.to_string(),
            status: updated.status,
        });
        Ok(updated)
    }

    async fn scan_forward(
        &self,
        vault: &VaultId,
        load_type: LoadType,
        start_exclusive: Option<StopTime>,
        limit: usize,
    ) -> StoreResult<Vec<QueueEntry>> {
        let prefix = load_type.sort_prefix();
        let start_key = match start_exclusive {
            Some(t) => format!("{prefix}{}", t.key_for(load_type)),
            None => prefix.clone(),
        };
        let queue = self.queue.read().await;
        let entries = queue
            .range((
                Bound::Excluded((vault.clone(), start_key)),
                Bound::Unbounded,
            ))
            .take_while(|((v, k), _)| v == vault && k.starts_with(&prefix))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect();
        Ok(entries)
    }

    async fn get_vault_state(&self, vault: &VaultId) -> StoreResult<Option<VaultState>> {
        Ok(self.states.read().await.get(vault).cloned())
    }

    async fn init_vault_state(&self, vault: &VaultId, state: VaultState) -> StoreResult<()> {
        let mut states = self.states.write().await;
        if !states.contains_key(vault) {
            states.insert(vault.clone(), state);
            drop(states);
            self.emit(ChangeEvent::VaultStateChanged {
                vault_id: vault.clone(),
            });
        }
        Ok(())
    }

    async fn update_vault_state(
        &self,
        vault: &VaultId,
        expected_epoch: Epoch,
        state: VaultState,
    ) -> StoreResult<()> {
        let mut states = self.states.write().await;
        let current = states
            .get_mut(vault)
            .ok_or_else(|| StoreError::NotFound(format!("vault state {vault}")))?;
        if current.current_epoch != expected_epoch {
            return Err(StoreError::PreconditionFailed(format!(
                "vault {vault} is at epoch {}, expected {expected_epoch}",
                current.current_epoch
            )));
        }
        *current = state;
        drop(states);
        self.emit(ChangeEvent::VaultStateChanged {
            vault_id: vault.clone(),
        });
        Ok(())
    }

    async fn acquire_lease(
        &self,
        lease_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Lease> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        if let Some(existing) = leases.get(lease_key) {
            if existing.owner != owner && !existing.is_expired(now) {
                return Err(StoreError::PreconditionFailed(format!(
                    "lease {lease_key} held by another owner until {}",
                    existing.expires_at
                )));
            }
        }
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        };
        leases.insert(lease_key.to_string(), lease.clone());
        Ok(lease)
    }

    async fn renew_lease(
        &self,
        lease_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Lease> {
        let now = Utc::now();
        let mut leases = self.leases.write().await;
        match leases.get_mut(lease_key) {
            Some(existing) if existing.owner == owner && !existing.is_expired(now) => {
                existing.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
                Ok(existing.clone())
            }
            Some(_) => Err(StoreError::PreconditionFailed(format!(
                "lease {lease_key} expired or changed hands"
            ))),
            None => Err(StoreError::NotFound(format!("lease {lease_key}"))),
        }
    }

    async fn get_lease(&self, lease_key: &str) -> StoreResult<Option<Lease>> {
        Ok(self.leases.read().await.get(lease_key).cloned())
    }

    async fn release_lease(&self, lease_key: &str, owner: &str) -> StoreResult<()> {
        let mut leases = self.leases.write().await;
        match leases.get(lease_key) {
            Some(existing) if existing.owner == owner => {
                leases.remove(lease_key);
                Ok(())
            }
            Some(_) => Err(StoreError::PreconditionFailed(format!(
                "lease {lease_key} held by another owner"
            ))),
            None => Ok(()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn vault() -> VaultId {
        VaultId::new("v1").unwrap()
    }

    fn incr_entry(minute: u32, checksum: &str) -> QueueEntry {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let dt = date
            .and_hms_opt(0, minute, 0)
            .unwrap()
            .and_utc();
        QueueEntry::ready(
            vault(),
            LoadType::Incr,
            StopTime::from_datetime(dt),
            format!("vault=v1/incr/stoptime=2024010100{minute:02}"),
            checksum.to_string(),
            Epoch(0),
        )
    }

    #[tokio::test]
    async fn registration_is_idempotent_on_same_checksum() {
        let store = MemoryStore::new();
        let entry = incr_entry(15, "sum-a");

        assert_eq!(
            store.put_if_absent(entry.clone()).await.unwrap(),
            Registration::Created
        );
        assert_eq!(
            store.put_if_absent(entry.clone()).await.unwrap(),
            Registration::AlreadyRegistered
        );
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn registration_rejects_different_checksum_without_mutation() {
        let store = MemoryStore::new();
        let entry = incr_entry(15, "sum-a");
        store.put_if_absent(entry.clone()).await.unwrap();

        let mut conflicting = incr_entry(15, "sum-b");
        conflicting.staging_prefix = "elsewhere".to_string();
        let err = store.put_if_absent(conflicting).await.unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));

        let stored = store
            .get_entry(&vault(), &entry.sort_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.checksum, "sum-a");
        assert_eq!(stored.staging_prefix, entry.staging_prefix);
    }

    #[tokio::test]
    async fn conditional_update_enforces_expected_status() {
        let store = MemoryStore::new();
        let entry = incr_entry(15, "sum-a");
        let sort_key = entry.sort_key();
        store.put_if_absent(entry).await.unwrap();

        let claimed = store
            .conditional_update(
                &vault(),
                &sort_key,
                EntryStatus::Ready,
                EntryUpdate::to(EntryStatus::Processing).bumping_attempts(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, EntryStatus::Processing);
        assert_eq!(claimed.attempt_count, 1);

        let err = store
            .conditional_update(
                &vault(),
                &sort_key,
                EntryStatus::Ready,
                EntryUpdate::to(EntryStatus::Processing),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn racing_claims_admit_exactly_one_winner() {
        let store = MemoryStore::new();
        let entry = incr_entry(15, "sum-a");
        let sort_key = entry.sort_key();
        store.put_if_absent(entry).await.unwrap();

        let vault_id = vault();
        let claim = || {
            store.conditional_update(
                &vault_id,
                &sort_key,
                EntryStatus::Ready,
                EntryUpdate::to(EntryStatus::Processing).bumping_attempts(),
            )
        };
        let (a, b) = tokio::join!(claim(), claim());
        let wins = [a.is_ok(), b.is_ok()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn scan_is_ordered_and_respects_start_and_load_type() {
        let store = MemoryStore::new();
        for minute in [45, 15, 30] {
            store
                .put_if_absent(incr_entry(minute, "sum"))
                .await
                .unwrap();
        }
        // A LOG entry for the same vault must never show up in INCR scans.
        let log_entry = QueueEntry::ready(
            vault(),
            LoadType::Log,
            StopTime::from_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            "vault=v1/log/date=20240101".to_string(),
            "logsum".to_string(),
            Epoch(0),
        );
        store.put_if_absent(log_entry).await.unwrap();

        let all = store
            .scan_forward(&vault(), LoadType::Incr, None, 10)
            .await
            .unwrap();
        let minutes: Vec<String> = all.iter().map(|e| e.logical_time.minute_key()).collect();
        assert_eq!(
            minutes,
            ["202401010015", "202401010030", "202401010045"]
        );

        let after_15 = store
            .scan_forward(
                &vault(),
                LoadType::Incr,
                Some(all[0].logical_time),
                10,
            )
            .await
            .unwrap();
        assert_eq!(after_15.len(), 2);
        assert_eq!(after_15[0].logical_time.minute_key(), "202401010030");
    }

    #[tokio::test]
    async fn vault_state_cas_guards_on_epoch() {
        let store = MemoryStore::new();
        store
            .init_vault_state(&vault(), VaultState::default())
            .await
            .unwrap();

        let mut next = VaultState::default();
        next.current_epoch = Epoch(1);
        store
            .update_vault_state(&vault(), Epoch(0), next.clone())
            .await
            .unwrap();

        // A writer still assuming epoch 0 must lose.
        let err = store
            .update_vault_state(&vault(), Epoch(0), VaultState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        // init on an existing vault is a no-op.
        store
            .init_vault_state(&vault(), VaultState::default())
            .await
            .unwrap();
        let state = store.get_vault_state(&vault()).await.unwrap().unwrap();
        assert_eq!(state.current_epoch, Epoch(1));
    }

    #[tokio::test]
    async fn lease_exclusivity_and_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store.acquire_lease("v1", "owner-a", ttl).await.unwrap();
        let err = store.acquire_lease("v1", "owner-b", ttl).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        // Same owner may re-acquire (extends).
        store.acquire_lease("v1", "owner-a", ttl).await.unwrap();

        // An expired lease is up for grabs.
        store
            .acquire_lease("v2", "owner-a", Duration::from_secs(0))
            .await
            .unwrap();
        store.acquire_lease("v2", "owner-b", ttl).await.unwrap();

        // Renewal of a lost lease fails.
        let err = store
            .renew_lease("v2", "owner-a", ttl)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));

        // Release by the holder; releasing again is a no-op.
        store.release_lease("v1", "owner-a").await.unwrap();
        store.release_lease("v1", "owner-a").await.unwrap();
    }

    #[tokio::test]
    async fn change_events_flow_on_mutation() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        let entry = incr_entry(15, "sum-a");
        let sort_key = entry.sort_key();
        store.put_if_absent(entry).await.unwrap();
        store
            .conditional_update(
                &vault(),
                &sort_key,
                EntryStatus::Ready,
                EntryUpdate::to(EntryStatus::Processing).bumping_attempts(),
            )
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ChangeEvent::EntryRegistered { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChangeEvent::EntryUpdated {
                status: EntryStatus::Processing,
                ..
            }
        ));
    }
}
