#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-store-core** – Control-plane store abstraction for Lode.
//!
//! This crate defines the contract the queue and vault-state tables must
//! satisfy, without providing concrete drivers. Any store offering
//! conditional single-item updates, ordered range scans on the sort key,
//! and a change-notification stream satisfies it; the in-memory and sled
//! drivers live in separate crates that depend on this core abstraction.
//!
//! All mutation goes through single-item compare-and-swap; the store is
//! the only shared mutable state in the system, which is what makes the
//! consumer re-entrant and crash-safe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use lode_types::{
    EntryStatus, Epoch, Lease, LoadType, QueueEntry, StopTime, VaultId, VaultState,
};

pub mod alert;
pub mod retry;

pub use alert::{Alert, Severity, TracingAlert};
pub use retry::{with_retries, RetryPolicy};

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Errors surfaced by control-plane store operations.
///
/// The taxonomy drives recovery: `Transient` is retried locally with
/// backoff, `PreconditionFailed` is recovered by re-reading state and
/// re-selecting, and `ChecksumMismatch` is a fatal protocol error that
/// requires an operator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional write observed different state than expected.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The addressed entry or vault state does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Re-registration of an existing key with a different checksum.
    #[error("duplicate entry {key} with different checksum: stored {stored}, offered {offered}")]
    ChecksumMismatch {
        /// Sort key of the conflicting entry.
        key: String,
        /// Checksum already persisted.
        stored: String,
        /// Checksum offered by the re-registration.
        offered: String,
    },

    /// A retryable driver failure (throttling, I/O blip).
    #[error("transient store error: {0}")]
    Transient(String),

    /// A stored value failed to decode.
    #[error("corrupt store value: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the operation may be retried as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

//─────────────────────────────
//  Change events
//─────────────────────────────

/// Change-stream notification emitted after a successful queue mutation.
///
/// Delivery is at-least-once and may be duplicated or reordered across
/// keys; subscribers must treat every event as a wakeup hint, not as
/// authoritative state, and re-read the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// A new entry was registered.
    EntryRegistered {
        /// Owning vault.
        vault_id: VaultId,
        /// Sort key of the new entry.
        sort_key: String,
    },
    /// An existing entry changed status.
    EntryUpdated {
        /// Owning vault.
        vault_id: VaultId,
        /// Sort key of the entry.
        sort_key: String,
        /// Status after the update.
        status: EntryStatus,
    },
    /// Vault state was rewritten (watermark advance, mode flip, rewind).
    VaultStateChanged {
        /// The vault whose state changed.
        vault_id: VaultId,
    },
}

//─────────────────────────────
//  Mutations
//─────────────────────────────

/// Outcome of an idempotent registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The entry did not exist and was created.
    Created,
    /// An identical entry (same key and checksum) already existed; no-op.
    AlreadyRegistered,
}

/// Field changes applied by a conditional status transition.
#[derive(Debug, Clone)]
pub struct EntryUpdate {
    /// Status to transition to.
    pub status: EntryStatus,
    /// Replace `last_error` with this value (`None` clears it).
    pub last_error: Option<String>,
    /// Increment `attempt_count` by one.
    pub bump_attempts: bool,
    /// Rewrite the entry's epoch (used by the full-load rewind).
    pub epoch: Option<Epoch>,
}

impl EntryUpdate {
    /// Transition to `status`, clearing any previous error.
    pub fn to(status: EntryStatus) -> Self {
        Self {
            status,
            last_error: None,
            bump_attempts: false,
            epoch: None,
        }
    }

    /// Record an error message alongside the transition. Messages are
    /// bounded so a pathological driver error cannot bloat the store.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        let msg: String = error
            .into()
            .chars()
            .take(lode_types::MAX_LAST_ERROR_LEN)
            .collect();
        self.last_error = Some(msg);
        self
    }

    /// Increment the attempt counter.
    pub fn bumping_attempts(mut self) -> Self {
        self.bump_attempts = true;
        self
    }

    /// Rewrite the entry's epoch.
    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

//─────────────────────────────
//  Store contract
//─────────────────────────────

/// The control-plane store contract.
///
/// Semantics, not a wire protocol: drivers are free to map tables, keys
/// and conditions onto whatever primitives the underlying store offers,
/// as long as every method behaves as documented here.
#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    /// Register an entry if `(vault_id, sort_key)` is absent.
    ///
    /// If an entry already exists with the same checksum this is a no-op
    /// (`Registration::AlreadyRegistered`); with a different checksum it
    /// fails `StoreError::ChecksumMismatch` without mutating anything.
    async fn put_if_absent(&self, entry: QueueEntry) -> StoreResult<Registration>;

    /// Fetch one entry by key.
    async fn get_entry(
        &self,
        vault: &VaultId,
        sort_key: &str,
    ) -> StoreResult<Option<QueueEntry>>;

    /// Atomically transition an entry's status.
    ///
    /// Fails `PreconditionFailed` when the stored status differs from
    /// `expected`. On success returns the updated entry.
    async fn conditional_update(
        &self,
        vault: &VaultId,
        sort_key: &str,
        expected: EntryStatus,
        update: EntryUpdate,
    ) -> StoreResult<QueueEntry>;

    /// Entries for `(vault, load_type)` in ascending sort-key order,
    /// strictly after `start_exclusive` when given.
    async fn scan_forward(
        &self,
        vault: &VaultId,
        load_type: LoadType,
        start_exclusive: Option<StopTime>,
        limit: usize,
    ) -> StoreResult<Vec<QueueEntry>>;

    /// Fetch a vault's control state.
    async fn get_vault_state(&self, vault: &VaultId) -> StoreResult<Option<VaultState>>;

    /// Create the vault state row if absent; existing state is left
    /// untouched (idempotent bootstrap).
    async fn init_vault_state(&self, vault: &VaultId, state: VaultState) -> StoreResult<()>;

    /// Replace a vault's state, guarded by its current epoch.
    ///
    /// Fails `PreconditionFailed` when the stored `current_epoch` differs
    /// from `expected_epoch` (a concurrent full-load trigger won).
    async fn update_vault_state(
        &self,
        vault: &VaultId,
        expected_epoch: Epoch,
        state: VaultState,
    ) -> StoreResult<()>;

    /// Acquire an exclusive lease, honoring expiry of a previous holder.
    ///
    /// Fails `PreconditionFailed` when a different owner holds an
    /// unexpired lease.
    async fn acquire_lease(
        &self,
        lease_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Lease>;

    /// Extend a lease currently held by `owner`.
    ///
    /// Fails `PreconditionFailed` when the lease expired or changed hands.
    async fn renew_lease(
        &self,
        lease_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> StoreResult<Lease>;

    /// Fetch a lease record without mutating it.
    async fn get_lease(&self, lease_key: &str) -> StoreResult<Option<Lease>>;

    /// Release a lease held by `owner`. Releasing an absent lease is a
    /// no-op; releasing someone else's lease fails `PreconditionFailed`.
    async fn release_lease(&self, lease_key: &str, owner: &str) -> StoreResult<()>;

    /// Subscribe to the change stream.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
