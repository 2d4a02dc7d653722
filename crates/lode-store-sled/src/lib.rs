#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-store-sled** – Durable embedded control-plane store driver for Lode.
//!
//! The store keeps three trees: the queue, the vault-state table, and the
//! lease table. Conditional writes map onto `sled::Tree::compare_and_swap`
//! over the serialized prior value; ordered scans map onto range iteration
//! over a binary-sortable composite key. Values are JSON so an operator can
//! inspect the control plane with nothing but `strings`.
//!
//! The change stream is a process-local broadcast channel: events reach
//! subscribers in the same process that performed the mutation. A
//! multi-process deployment gets its wakeups from the store's own change
//! feed instead; the daemon's periodic safety tick covers the gap.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, Tree};
use tokio::sync::broadcast;

use lode_store_core::{
    ChangeEvent, ControlPlaneStore, EntryUpdate, Registration, StoreError, StoreResult,
};
use lode_types::{
    EntryStatus, Epoch, Lease, LoadType, QueueEntry, StopTime, VaultId, VaultState,
};

/// Default broadcast channel size for the change stream.
const DEFAULT_BROADCAST_SIZE: usize = 256;

/// Separator between the vault id and the sort key in composite keys.
/// Vault ids reject NUL, so the encoding is unambiguous and order-preserving.
const KEY_SEP: u8 = 0;

/// A durable control-plane store backed by the sled embedded database.
#[derive(Debug)]
pub struct SledStore {
    _db: Db, // Keep reference to prevent premature database closure
    queue: Tree,
    states: Tree,
    leases: Tree,
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl SledStore {
    /// Open or create a store at `path` with the default table names.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_tables(path, "queue", "vault_state", "leases")
    }

    /// Open or create a store at `path` with explicit table names.
    pub fn open_with_tables<P: AsRef<Path>>(
        path: P,
        queue_table: &str,
        state_table: &str,
        lease_table: &str,
    ) -> StoreResult<Self> {
        let db = sled::open(path).map_err(map_sled)?;
        Self::from_db(db, queue_table, state_table, lease_table)
    }

    /// Build a store from an existing sled database and table names.
    pub fn from_db(
        db: Db,
        queue_table: &str,
        state_table: &str,
        lease_table: &str,
    ) -> StoreResult<Self> {
        let queue = db.open_tree(queue_table).map_err(map_sled)?;
        let states = db.open_tree(state_table).map_err(map_sled)?;
        let leases = db.open_tree(lease_table).map_err(map_sled)?;
        let (change_tx, _) = broadcast::channel(DEFAULT_BROADCAST_SIZE);
        Ok(Self {
            _db: db,
            queue,
            states,
            leases,
            change_tx,
        })
    }

    /// Temporary store for tests; removed when dropped.
    #[cfg(test)]
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(map_sled)?;
        Self::from_db(db, "queue", "vault_state", "leases")
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> StoreResult<()> {
        self.queue.flush_async().await.map_err(map_sled)?;
        self.states.flush_async().await.map_err(map_sled)?;
        self.leases.flush_async().await.map_err(map_sled)?;
        Ok(())
    }

    fn emit(&self, event: ChangeEvent) {
        let _ = self.change_tx.send(event);
    }

    fn entry_key(vault: &VaultId, sort_key: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(vault.as_str().len() + 1 + sort_key.len());
        key.extend_from_slice(vault.as_str().as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(sort_key.as_bytes());
        key
    }
}

fn map_sled(err: sled::Error) -> StoreError {
    match err {
        sled::Error::Io(e) => StoreError::Transient(format!("sled io: {e}")),
        other => StoreError::Corrupt(format!("sled: {other}")),
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8], what: &str) -> StoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode {what}: {e}")))
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| StoreError::Corrupt(format!("failed to encode {what}: {e}")))
}

#[async_trait]
impl ControlPlaneStore for SledStore {
    async fn put_if_absent(&self, entry: QueueEntry) -> StoreResult<Registration> {
        let sort_key = entry.sort_key();
        let key = Self::entry_key(&entry.vault_id, &sort_key);
        let bytes = encode(&entry, "queue entry")?;
        match self
            .queue
            .compare_and_swap(&key, None::<&[u8]>, Some(bytes))
            .map_err(map_sled)?
        {
            Ok(()) => {
                self.emit(ChangeEvent::EntryRegistered {
                    vault_id: entry.vault_id.clone(),
                    sort_key,
                });
                Ok(Registration::Created)
            }
            Err(cas) => {
                let current = cas
                    .current
                    .ok_or_else(|| StoreError::Corrupt("cas reported no current".into()))?;
                let existing: QueueEntry = decode(&current, "queue entry")?;
                if existing.checksum == entry.checksum {
                    Ok(Registration::AlreadyRegistered)
                } else {
                    Err(StoreError::ChecksumMismatch {
                        key: sort_key,
                        stored: existing.checksum,
                        offered: entry.checksum,
                    })
                }
            }
        }
    }

    async fn get_entry(
        &self,
        vault: &VaultId,
        sort_key: &str,
    ) -> StoreResult<Option<QueueEntry>> {
        let key = Self::entry_key(vault, sort_key);
        match self.queue.get(&key).map_err(map_sled)? {
            Some(bytes) => Ok(Some(decode(&bytes, "queue entry")?)),
            None => Ok(None),
        }
    }

    async fn conditional_update(
        &self,
        vault: &VaultId,
        sort_key: &str,
        expected: EntryStatus,
        update: EntryUpdate,
    ) -> StoreResult<QueueEntry> {
        let key = Self::entry_key(vault, sort_key);
        loop {
            let current = self
                .queue
                .get(&key)
                .map_err(map_sled)?
                .ok_or_else(|| StoreError::NotFound(format!("entry {sort_key}")))?;
            let entry: QueueEntry = decode(&current, "queue entry")?;
            if entry.status != expected {
                return Err(StoreError::PreconditionFailed(format!(
                    "entry {sort_key} is {}, expected {expected}",
                    entry.status
                )));
            }
            let mut updated = entry;
            updated.status = update.status;
            updated.last_error = update.last_error.clone();
            if update.bump_attempts {
                updated.attempt_count += 1;
            }
            if let Some(epoch) = update.epoch {
                updated.epoch = epoch;
            }
            updated.updated_at = Utc::now();
            let new_bytes = encode(&updated, "queue entry")?;
            match self
                .queue
                .compare_and_swap(&key, Some(&current), Some(new_bytes))
                .map_err(map_sled)?
            {
                Ok(()) => {
                    self.emit(ChangeEvent::EntryUpdated {
                        vault_id: vault.clone(),
                        sort_key: sort_key.to_string(),
                        status: updated.status,
                    });
                    return Ok(updated);
                }
                // Lost the swap; re-read and re-check the precondition.
                Err(_) => continue,
            }
        }
    }

    async fn scan_forward(
        &self,
        vault: &VaultId,
        load_type: LoadType,
        start_exclusive: Option<StopTime>,
        limit: usize,
    ) -> StoreResult<Vec<QueueEntry>> {
        let prefix = load_type.sort_prefix();
        let start_sort_key = match start_exclusive {
            Some(t) => format!("{prefix}{}", t.key_for(load_type)),
            None => prefix.clone(),
        };
        let start_key = Self::entry_key(vault, &start_sort_key);
        let mut key_prefix = Vec::with_capacity(vault.as_str().len() + 1 + prefix.len());
        key_prefix.extend_from_slice(vault.as_str().as_bytes());
        key_prefix.push(KEY_SEP);
        key_prefix.extend_from_slice(prefix.as_bytes());

        let mut entries = Vec::new();
        for item in self.queue.range(start_key.clone()..) {
            let (key, value) = item.map_err(map_sled)?;
            if !key.starts_with(&key_prefix) {
                break;
            }
            // The start key itself is excluded from the scan.
            if key.as_ref() == start_key.as_slice() {
                continue;
            }
            entries.push(decode(&value, "queue entry")?);
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }

    async fn get_vault_state(&self, vault: &VaultId) -> StoreResult<Option<VaultState>> {
        match self.states.get(vault.as_str()).map_err(map_sled)? {
            Some(bytes) => Ok(Some(decode(&bytes, "vault state")?)),
            None => Ok(None),
        }
    }

    async fn init_vault_state(&self, vault: &VaultId, state: VaultState) -> StoreResult<()> {
        let bytes = encode(&state, "vault state")?;
        match self
            .states
            .compare_and_swap(vault.as_str(), None::<&[u8]>, Some(bytes))
            .map_err(map_sled)?
        {
            Ok(()) => {
                self.emit(ChangeEvent::VaultStateChanged {
                    vault_id: vault.clone(),
                });
                Ok(())
            }
            // Already initialized; leave existing state untouched.
            Err(_) => Ok(()),
        }
    }

    async fn update_vault_state(
        &self,
        vault: &VaultId,
        expected_epoch: Epoch,
        state: VaultState,
    ) -> StoreResult<()> {
        loop {
            let current = self
                .states
                .get(vault.as_str())
                .map_err(map_sled)?
                .ok_or_else(|| StoreError::NotFound(format!("vault state {vault}")))?;
            let stored: VaultState = decode(&current, "vault state")?;
            if stored.current_epoch != expected_epoch {
                return Err(StoreError::PreconditionFailed(format!(
                    "vault {vault} is at epoch {}, expected {expected_epoch}",
                    stored.current_epoch
                )));
            }
            let new_bytes = encode(&state, "vault state")?;
            match self
                .states
                .compare_and_swap(vault.as_str(), Some(&current), Some(new_bytes))
                .map_err(map_sled)?
            {
                Ok(()) => {
                    self.emit(ChangeEvent::VaultStateChanged {
                        vault_id: vault.clone(),
                    });
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }

    async fn acquire_lease(
        &self,
        lease_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Lease> {
        loop {
            let now = Utc::now();
            let current = self.leases.get(lease_key).map_err(map_sled)?;
            if let Some(bytes) = &current {
                let existing: Lease = decode(bytes, "lease")?;
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
            let new_bytes = encode(&lease, "lease")?;
            let swap = match &current {
                Some(bytes) => self
                    .leases
                    .compare_and_swap(lease_key, Some(bytes), Some(new_bytes)),
                None => self
                    .leases
                    .compare_and_swap(lease_key, None::<&[u8]>, Some(new_bytes)),
            };
            match swap.map_err(map_sled)? {
                Ok(()) => return Ok(lease),
                Err(_) => continue,
            }
        }
    }

    async fn renew_lease(
        &self,
        lease_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Lease> {
        loop {
            let now = Utc::now();
            let current = self
                .leases
                .get(lease_key)
                .map_err(map_sled)?
                .ok_or_else(|| StoreError::NotFound(format!("lease {lease_key}")))?;
            let existing: Lease = decode(&current, "lease")?;
            if existing.owner != owner || existing.is_expired(now) {
                return Err(StoreError::PreconditionFailed(format!(
                    "lease {lease_key} expired or changed hands"
                )));
            }
            let lease = Lease {
                owner: owner.to_string(),
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            };
            let new_bytes = encode(&lease, "lease")?;
            match self
                .leases
                .compare_and_swap(lease_key, Some(&current), Some(new_bytes))
                .map_err(map_sled)?
            {
                Ok(()) => return Ok(lease),
                Err(_) => continue,
            }
        }
    }

    async fn get_lease(&self, lease_key: &str) -> StoreResult<Option<Lease>> {
        match self.leases.get(lease_key).map_err(map_sled)? {
            Some(bytes) => Ok(Some(decode(&bytes, "lease")?)),
            None => Ok(None),
        }
    }

    async fn release_lease(&self, lease_key: &str, owner: &str) -> StoreResult<()> {
        loop {
            let current = match self.leases.get(lease_key).map_err(map_sled)? {
                Some(bytes) => bytes,
                None => return Ok(()),
            };
            let existing: Lease = decode(&current, "lease")?;
            if existing.owner != owner {
                return Err(StoreError::PreconditionFailed(format!(
                    "lease {lease_key} held by another owner"
                )));
            }
            match self
                .leases
                .compare_and_swap(lease_key, Some(&current), None::<&[u8]>)
                .map_err(map_sled)?
            {
                Ok(()) => return Ok(()),
                Err(_) => continue,
            }
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
        let dt = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
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
    async fn registration_idempotency() {
        let store = SledStore::temporary().unwrap();
        let entry = incr_entry(15, "sum-a");

        assert_eq!(
            store.put_if_absent(entry.clone()).await.unwrap(),
            Registration::Created
        );
        assert_eq!(
            store.put_if_absent(entry.clone()).await.unwrap(),
            Registration::AlreadyRegistered
        );

        let conflicting = incr_entry(15, "sum-b");
        let err = store.put_if_absent(conflicting).await.unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn conditional_update_and_scan() {
        let store = SledStore::temporary().unwrap();
        for minute in [30, 15, 45] {
            store.put_if_absent(incr_entry(minute, "sum")).await.unwrap();
        }

        let all = store
            .scan_forward(&vault(), LoadType::Incr, None, 10)
            .await
            .unwrap();
        let minutes: Vec<String> = all.iter().map(|e| e.logical_time.minute_key()).collect();
        assert_eq!(minutes, ["202401010015", "202401010030", "202401010045"]);

        let after = store
            .scan_forward(&vault(), LoadType::Incr, Some(all[0].logical_time), 10)
            .await
            .unwrap();
        assert_eq!(after.len(), 2);

        let sort_key = all[0].sort_key();
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
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = SledStore::open(&path).unwrap();
            store
                .init_vault_state(&vault(), VaultState::default())
                .await
                .unwrap();
            store.put_if_absent(incr_entry(15, "sum-a")).await.unwrap();
            store.flush().await.unwrap();
        }
        let store = SledStore::open(&path).unwrap();
        assert!(store.get_vault_state(&vault()).await.unwrap().is_some());
        let entries = store
            .scan_forward(&vault(), LoadType::Incr, None, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].checksum, "sum-a");
    }

    #[tokio::test]
    async fn vault_state_epoch_guard() {
        let store = SledStore::temporary().unwrap();
        store
            .init_vault_state(&vault(), VaultState::default())
            .await
            .unwrap();

        let next = VaultState {
            current_epoch: Epoch(1),
            ..VaultState::default()
        };
        store
            .update_vault_state(&vault(), Epoch(0), next)
            .await
            .unwrap();
        let err = store
            .update_vault_state(&vault(), Epoch(0), VaultState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn lease_lifecycle() {
        let store = SledStore::temporary().unwrap();
        let ttl = Duration::from_secs(60);

        store.acquire_lease("v1", "a", ttl).await.unwrap();
        assert!(matches!(
            store.acquire_lease("v1", "b", ttl).await.unwrap_err(),
            StoreError::PreconditionFailed(_)
        ));
        store.renew_lease("v1", "a", ttl).await.unwrap();
        store.release_lease("v1", "a").await.unwrap();
        store.acquire_lease("v1", "b", ttl).await.unwrap();
    }
}
