#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-apply** – Per-window apply engine for Lode.
//!
//! Given one staged window, the engine reconciles warehouse schemas with
//! the window's manifest and loads the window's data in a single warehouse
//! transaction: delete-then-upsert for incremental windows, truncate (or
//! recreate) for full snapshots. It is the only component that touches
//! warehouse data tables.
//!
//! Phase order per window: fetch manifest, build the schema registry,
//! validate every schema change, execute idempotent DDL, then BEGIN,
//! cleanup, COPY, COMMIT. Validation runs to completion before the first
//! DDL statement, so a forbidden type change fails the window with the
//! warehouse untouched.

use async_trait::async_trait;

use lode_staging::ManifestError;
use lode_warehouse_core::{LogicalType, WarehouseError};

pub mod engine;
pub mod schema;

pub use engine::{ApplyEngine, ApplyOutcome, ApplyRequest};
pub use schema::{
    detect_fractional_columns, map_vendor_type, transition_allowed, SchemaRegistry,
};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors produced while applying one window.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The window violates the staging protocol: missing manifest or
    /// metadata, a manifest referencing absent files, malformed rows.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The manifest could not be decoded.
    #[error("protocol error: {0}")]
    Manifest(#[from] ManifestError),

    /// The manifest asks for a narrowing or destructive type change.
    #[error(
        "incompatible schema change on {object}.{column}: {from} -> {to}"
    )]
    IncompatibleSchemaChange {
        /// Affected object.
        object: String,
        /// Affected column.
        column: String,
        /// Live type.
        from: LogicalType,
        /// Requested type.
        to: LogicalType,
    },

    /// The warehouse rejected DDL, a row, or the transaction.
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    /// The staging layer failed.
    #[error("staging error: {0}")]
    Staging(String),

    /// The consumer's lease was lost before COMMIT; the transaction was
    /// rolled back.
    #[error("lease lost before commit")]
    LeaseLost,
}

impl ApplyError {
    /// Whether this failure is a protocol error (operator attention, not a
    /// retry, is the fix).
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ApplyError::Protocol(_)
                | ApplyError::Manifest(_)
                | ApplyError::IncompatibleSchemaChange { .. }
        )
    }
}

//─────────────────────────────
//  Commit gate
//─────────────────────────────

/// Checked immediately before COMMIT; a denial rolls the window back.
///
/// The consumer gates commits on still holding its vault lease, which is
/// what turns lease loss mid-apply into a clean pre-commit abort.
#[async_trait]
pub trait CommitGate: Send + Sync {
    /// Whether the caller still has the right to commit.
    async fn may_commit(&self) -> bool;
}

/// Gate that always allows the commit; tests and operator one-shots.
#[derive(Debug, Clone, Default)]
pub struct AlwaysCommit;

#[async_trait]
impl CommitGate for AlwaysCommit {
    async fn may_commit(&self) -> bool {
        true
    }
}
