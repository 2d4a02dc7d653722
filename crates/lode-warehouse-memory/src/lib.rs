#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-warehouse-memory** – In-memory warehouse driver for Lode.
//!
//! Transactions clone the whole table map on `begin` and swap it back on
//! `commit`; `rollback` simply drops the clone. That makes apply atomicity
//! directly observable in tests: until commit, readers see the pre-window
//! tables, bit for bit.
//!
//! `begin` holds the single table lock for the life of the transaction —
//! the pool-of-one discipline the consumer relies on. DDL is auto-committed
//! and must therefore run before `begin`, which is exactly the phase order
//! the apply engine follows.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use lode_warehouse_core::{
    ColumnDef, LogicalType, TableSchema, Warehouse, WarehouseError, WarehouseTxn,
};

//─────────────────────────────
//  Table model
//─────────────────────────────

/// One materialized table: ordered columns plus rows aligned to them.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    /// Ordered column definitions.
    pub columns: Vec<ColumnDef>,
    /// Primary-key column names.
    pub key_columns: Vec<String>,
    /// Row values, `None` meaning NULL, aligned to `columns`.
    pub rows: Vec<Vec<Option<String>>>,
}

impl TableData {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

type Tables = IndexMap<String, TableData>;

//─────────────────────────────
//  Driver
//─────────────────────────────

/// An in-memory warehouse with snapshot-isolation transactions.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryWarehouse {
    /// Create an empty warehouse.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot one table for inspection; `None` when absent.
    pub async fn table(&self, name: &str) -> Option<TableData> {
        self.tables.lock().await.get(name).cloned()
    }

    /// Number of rows currently committed in `name`, or `None` when absent.
    pub async fn row_count(&self, name: &str) -> Option<usize> {
        self.tables.lock().await.get(name).map(|t| t.rows.len())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_columns(
        &self,
        table: &str,
    ) -> Result<Option<Vec<ColumnDef>>, WarehouseError> {
        Ok(self
            .tables
            .lock()
            .await
            .get(table)
            .map(|t| t.columns.clone()))
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(&schema.table) {
            tables.insert(
                schema.table.clone(),
                TableData {
                    columns: schema.columns.clone(),
                    key_columns: schema.key_columns.clone(),
                    rows: Vec::new(),
                },
            );
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<(), WarehouseError> {
        self.tables.lock().await.shift_remove(table);
        Ok(())
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().await;
        let data = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NoSuchTable(table.to_string()))?;
        if data.column_index(&column.name).is_some() {
            return Ok(());
        }
        data.columns.push(column.clone());
        for row in &mut data.rows {
            row.push(None);
        }
        Ok(())
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().await;
        let data = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NoSuchTable(table.to_string()))?;
        let Some(idx) = data.column_index(column) else {
            return Ok(());
        };
        data.columns.remove(idx);
        for row in &mut data.rows {
            row.remove(idx);
        }
        Ok(())
    }

    async fn alter_column_type(
        &self,
        table: &str,
        column: &str,
        new_type: &LogicalType,
    ) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().await;
        let data = tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NoSuchTable(table.to_string()))?;
        let idx = data
            .column_index(column)
            .ok_or_else(|| WarehouseError::NoSuchColumn {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        data.columns[idx].logical_type = new_type.clone();
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn WarehouseTxn>, WarehouseError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTxn { guard, working }))
    }
}

//─────────────────────────────
//  Transaction
//─────────────────────────────

struct MemoryTxn {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

impl MemoryTxn {
    fn table_mut(&mut self, table: &str) -> Result<&mut TableData, WarehouseError> {
        self.working
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NoSuchTable(table.to_string()))
    }
}

#[async_trait]
impl WarehouseTxn for MemoryTxn {
    async fn delete_where_key_in(
        &mut self,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> Result<u64, WarehouseError> {
        let data = self.table_mut(table)?;
        let mut indexes = Vec::with_capacity(key_columns.len());
        for name in key_columns {
            let idx = data
                .column_index(name)
                .ok_or_else(|| WarehouseError::NoSuchColumn {
                    table: table.to_string(),
                    column: name.clone(),
                })?;
            indexes.push(idx);
        }
        let victims: HashSet<&[String]> = keys.iter().map(|k| k.as_slice()).collect();
        let before = data.rows.len();
        data.rows.retain(|row| {
            let tuple: Vec<String> = indexes
                .iter()
                .map(|&i| row[i].clone().unwrap_or_default())
                .collect();
            !victims.contains(tuple.as_slice())
        });
        Ok((before - data.rows.len()) as u64)
    }

    async fn truncate(&mut self, table: &str) -> Result<(), WarehouseError> {
        self.table_mut(table)?.rows.clear();
        Ok(())
    }

    async fn copy_csv(
        &mut self,
        table: &str,
        columns: &[String],
        data: &[u8],
    ) -> Result<u64, WarehouseError> {
        let target = self.table_mut(table)?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(data);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| reject(table, format!("unreadable header: {e}")))?
            .iter()
            .map(|h| h.to_string())
            .collect();
        for name in columns {
            if !headers.iter().any(|h| h == name) {
                return Err(reject(table, format!("file is missing column {name}")));
            }
        }
        // Map each file column onto its table position.
        let mut positions = Vec::with_capacity(headers.len());
        for header in &headers {
            let idx = target
                .column_index(header)
                .ok_or_else(|| WarehouseError::NoSuchColumn {
                    table: table.to_string(),
                    column: header.clone(),
                })?;
            positions.push(idx);
        }

        let mut loaded = 0u64;
        for record in reader.records() {
            let record = record.map_err(|e| reject(table, format!("bad record: {e}")))?;
            let mut row: Vec<Option<String>> = vec![None; target.columns.len()];
            for (field, &idx) in record.iter().zip(&positions) {
                let column = &target.columns[idx];
                if field.is_empty() {
                    if !column.nullable {
                        return Err(reject(
                            table,
                            format!("NULL in non-nullable column {}", column.name),
                        ));
                    }
                    continue;
                }
                validate_value(field, &column.logical_type).map_err(|reason| {
                    reject(table, format!("column {}: {reason}", column.name))
                })?;
                row[idx] = Some(field.to_string());
            }
            target.rows.push(row);
            loaded += 1;
        }
        Ok(loaded)
    }

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError> {
        let mut guard = self.guard;
        *guard = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError> {
        // Dropping the working copy and the lock is the whole rollback.
        Ok(())
    }
}

fn reject(table: &str, reason: String) -> WarehouseError {
    WarehouseError::CopyRejected {
        table: table.to_string(),
        reason,
    }
}

fn validate_value(value: &str, ty: &LogicalType) -> Result<(), String> {
    match ty {
        LogicalType::Utf8 { max_len } => {
            if let Some(max) = max_len {
                let len = value.chars().count() as u32;
                if len > *max {
                    return Err(format!("value length {len} exceeds VARCHAR({max})"));
                }
            }
            Ok(())
        }
        LogicalType::Int64 => value
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| format!("{value:?} is not a BIGINT")),
        LogicalType::Float64 => value
            .parse::<f64>()
            .map(|_| ())
            .map_err(|_| format!("{value:?} is not a DOUBLE PRECISION")),
        LogicalType::Bool => {
            if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
                Ok(())
            } else {
                Err(format!("{value:?} is not a BOOLEAN"))
            }
        }
        LogicalType::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(|_| ())
            .map_err(|_| format!("{value:?} is not a DATE")),
        LogicalType::TimestampUtc => {
            if DateTime::parse_from_rfc3339(value).is_ok()
                || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
                || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
            {
                Ok(())
            } else {
                Err(format!("{value:?} is not a TIMESTAMPTZ"))
            }
        }
    }
}
