#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-warehouse-core** – Warehouse abstraction for Lode.
//!
//! The apply engine is the only component allowed to touch warehouse data
//! tables, and it does so exclusively through these traits. The contract
//! deliberately promises less than most warehouses offer: DDL is
//! auto-committed (some warehouses cannot run DDL transactionally), so
//! every DDL operation must be idempotent — existence is checked before
//! issuing, the way `ADD COLUMN IF NOT EXISTS` behaves.
//!
//! Transactions are scoped acquisitions: `commit` and `rollback` consume
//! the transaction, so every exit path must pick one explicitly. Nothing
//! relies on drop-time side effects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

//─────────────────────────────
//  Logical types
//─────────────────────────────

/// Warehouse-independent column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalType {
    /// Variable-length text, optionally bounded.
    Utf8 {
        /// Maximum length; `None` means unbounded.
        max_len: Option<u32>,
    },
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
    /// Calendar date.
    Date,
    /// Microsecond timestamp, UTC.
    TimestampUtc,
}

impl LogicalType {
    /// Unbounded text.
    pub fn utf8() -> Self {
        LogicalType::Utf8 { max_len: None }
    }

    /// Bounded text.
    pub fn utf8_with_len(max_len: u32) -> Self {
        LogicalType::Utf8 {
            max_len: Some(max_len),
        }
    }

    /// The default warehouse DDL type for this logical type.
    pub fn warehouse_type(&self) -> String {
        match self {
            LogicalType::Utf8 { max_len: None } => "VARCHAR(max)".to_string(),
            LogicalType::Utf8 { max_len: Some(n) } => format!("VARCHAR({n})"),
            LogicalType::Int64 => "BIGINT".to_string(),
            LogicalType::Float64 => "DOUBLE PRECISION".to_string(),
            LogicalType::Bool => "BOOLEAN".to_string(),
            LogicalType::Date => "DATE".to_string(),
            LogicalType::TimestampUtc => "TIMESTAMPTZ".to_string(),
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.warehouse_type())
    }
}

/// One column of a warehouse table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub logical_type: LogicalType,
    /// Whether NULLs are allowed.
    pub nullable: bool,
}

/// Full shape of one warehouse table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub table: String,
    /// Ordered columns.
    pub columns: Vec<ColumnDef>,
    /// Names of the primary-key columns, in key order.
    pub key_columns: Vec<String>,
}

impl TableSchema {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Ordered column names.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by warehouse operations.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// The addressed table does not exist.
    #[error("table {0} does not exist")]
    NoSuchTable(String),

    /// The addressed column does not exist.
    #[error("column {column} does not exist on {table}")]
    NoSuchColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A COPY rejected one or more rows.
    #[error("copy into {table} rejected: {reason}")]
    CopyRejected {
        /// Target table.
        table: String,
        /// Driver-reported reason.
        reason: String,
    },

    /// DDL could not be applied.
    #[error("ddl conflict: {0}")]
    DdlConflict(String),

    /// The transaction was aborted by the driver.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// Connection-level failure.
    #[error("warehouse connection error: {0}")]
    Connection(String),
}

//─────────────────────────────
//  Contracts
//─────────────────────────────

/// One open warehouse transaction.
///
/// Every row mutation of one window happens inside exactly one of these;
/// either everything commits or nothing is observable (apply atomicity).
#[async_trait]
pub trait WarehouseTxn: Send {
    /// Delete rows whose key tuple appears in `keys`.
    ///
    /// `keys` holds one value tuple per row, ordered like `key_columns`.
    /// Returns the number of rows deleted.
    async fn delete_where_key_in(
        &mut self,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> Result<u64, WarehouseError>;

    /// Remove all rows from `table`.
    async fn truncate(&mut self, table: &str) -> Result<(), WarehouseError>;

    /// Bulk-load CSV bytes (with a header row naming `columns`) into
    /// `table`. Returns the number of rows loaded.
    async fn copy_csv(
        &mut self,
        table: &str,
        columns: &[String],
        data: &[u8],
    ) -> Result<u64, WarehouseError>;

    /// Make every mutation of this transaction durable.
    async fn commit(self: Box<Self>) -> Result<(), WarehouseError>;

    /// Discard every mutation of this transaction.
    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError>;
}

/// A warehouse holding the final tables.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Live column set of `table`, or `None` when the table is absent.
    async fn table_columns(&self, table: &str)
        -> Result<Option<Vec<ColumnDef>>, WarehouseError>;

    /// Create `table` if absent (idempotent).
    async fn create_table(&self, schema: &TableSchema) -> Result<(), WarehouseError>;

    /// Drop `table` if present (idempotent).
    async fn drop_table(&self, table: &str) -> Result<(), WarehouseError>;

    /// Add `column` to `table` if absent (idempotent). Existing rows read
    /// NULL for the new column.
    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), WarehouseError>;

    /// Drop `column` from `table` if present (idempotent).
    async fn drop_column(&self, table: &str, column: &str) -> Result<(), WarehouseError>;

    /// Change `column`'s type. The caller is responsible for only issuing
    /// widenings; drivers may reject others with `DdlConflict`.
    async fn alter_column_type(
        &self,
        table: &str,
        column: &str,
        new_type: &LogicalType,
    ) -> Result<(), WarehouseError>;

    /// Open a transaction. Drivers size their connection pool to one per
    /// consumer, so a second open transaction waits rather than running
    /// in parallel.
    async fn begin(&self) -> Result<Box<dyn WarehouseTxn>, WarehouseError>;
}
