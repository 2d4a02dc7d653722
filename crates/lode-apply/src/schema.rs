//! Per-window schema registry and vendor type mapping.
//!
//! The registry is derived from the window's metadata plus a sample of the
//! staged data, and is never persisted across windows. Decimal detection in
//! particular is re-run for every window: a Number column is Int64 until a
//! sampled value carries a fractional part.

use std::collections::{HashMap, HashSet};

use lode_staging::ObjectColumn;
use lode_warehouse_core::{ColumnDef, LogicalType, TableSchema};

use crate::ApplyError;

/// Rows inspected per file when sniffing for fractional values.
const SAMPLE_ROWS: usize = 10_000;

//─────────────────────────────
//  Vendor type mapping
//─────────────────────────────

/// Map a vendor type token onto a logical type.
///
/// `fractional` reports whether decimal sniffing saw a fractional value in
/// this window's sample; it only matters for Number columns.
pub fn map_vendor_type(vendor: &str, max_length: Option<u32>, fractional: bool) -> LogicalType {
    match vendor.to_ascii_lowercase().as_str() {
        "string" | "picklist" | "text" => LogicalType::Utf8 { max_len: max_length },
        "number" => {
            if fractional {
                LogicalType::Float64
            } else {
                LogicalType::Int64
            }
        }
        "boolean" => LogicalType::Bool,
        "date" => LogicalType::Date,
        "datetime" => LogicalType::TimestampUtc,
        "reference" | "id" => LogicalType::Utf8 {
            max_len: Some(max_length.unwrap_or(255)),
        },
        _ => LogicalType::Utf8 { max_len: None },
    }
}

/// Which of `candidates` hold a fractional value anywhere in the sampled
/// rows of `csv_bytes`.
pub fn detect_fractional_columns(
    csv_bytes: &[u8],
    candidates: &HashSet<String>,
) -> Result<HashSet<String>, ApplyError> {
    let mut fractional = HashSet::new();
    if candidates.is_empty() {
        return Ok(fractional);
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_bytes);
    let headers = reader
        .headers()
        .map_err(|e| ApplyError::Protocol(format!("unreadable data header: {e}")))?
        .clone();
    let watched: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| candidates.contains(*name))
        .map(|(i, name)| (i, name.to_string()))
        .collect();
    if watched.is_empty() {
        return Ok(fractional);
    }
    for record in reader.records().take(SAMPLE_ROWS) {
        let record = record.map_err(|e| ApplyError::Protocol(format!("bad data record: {e}")))?;
        for (idx, name) in &watched {
            if fractional.contains(name) {
                continue;
            }
            if let Some(value) = record.get(*idx) {
                if !value.is_empty() && value.contains('.') {
                    fractional.insert(name.clone());
                }
            }
        }
        if fractional.len() == watched.len() {
            break;
        }
    }
    Ok(fractional)
}

//─────────────────────────────
//  Allowed transitions
//─────────────────────────────

/// Whether changing a live column from `from` to `to` is an allowed
/// widening. Everything outside the matrix fails the window.
pub fn transition_allowed(from: &LogicalType, to: &LogicalType) -> bool {
    match (from, to) {
        (a, b) if a == b => true,
        (LogicalType::Int64, LogicalType::Float64) => true,
        (LogicalType::Date, LogicalType::TimestampUtc) => true,
        (
            LogicalType::Utf8 { max_len: Some(n) },
            LogicalType::Utf8 { max_len: Some(m) },
        ) => m > n,
        (LogicalType::Utf8 { max_len: Some(_) }, LogicalType::Utf8 { max_len: None }) => true,
        _ => false,
    }
}

//─────────────────────────────
//  Registry
//─────────────────────────────

/// Target schemas of every object touched by one window.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    objects: HashMap<String, TableSchema>,
}

impl SchemaRegistry {
    /// Build the registry from metadata rows and per-object data samples.
    ///
    /// `samples` maps object names onto staged upsert-file bytes and feeds
    /// decimal sniffing; objects without a sample default their Number
    /// columns to Int64.
    pub fn build(
        metadata: &[ObjectColumn],
        samples: &HashMap<String, Vec<u8>>,
    ) -> Result<Self, ApplyError> {
        let mut grouped: Vec<(String, Vec<&ObjectColumn>)> = Vec::new();
        for column in metadata {
            match grouped.iter_mut().find(|(name, _)| *name == column.object_name) {
                Some((_, columns)) => columns.push(column),
                None => grouped.push((column.object_name.clone(), vec![column])),
            }
        }

        let mut objects = HashMap::new();
        for (object, columns) in grouped {
            let number_columns: HashSet<String> = columns
                .iter()
                .filter(|c| c.vendor_type.eq_ignore_ascii_case("number"))
                .map(|c| c.column_name.clone())
                .collect();
            let fractional = match samples.get(&object) {
                Some(bytes) => detect_fractional_columns(bytes, &number_columns)?,
                None => HashSet::new(),
            };

            let defs: Vec<ColumnDef> = columns
                .iter()
                .map(|c| ColumnDef {
                    name: c.column_name.clone(),
                    logical_type: map_vendor_type(
                        &c.vendor_type,
                        c.max_length,
                        fractional.contains(&c.column_name),
                    ),
                    nullable: c.nullable,
                })
                .collect();

            let mut key_columns: Vec<String> = columns
                .iter()
                .filter(|c| c.is_primary)
                .map(|c| c.column_name.clone())
                .collect();
            if key_columns.is_empty() {
                if let Some(first) = defs.first() {
                    key_columns.push(first.name.clone());
                }
            }

            objects.insert(
                object.clone(),
                TableSchema {
                    table: object,
                    columns: defs,
                    key_columns,
                },
            );
        }
        Ok(Self { objects })
    }

    /// Target schema of `object`, if the window's metadata describes it.
    pub fn object(&self, object: &str) -> Option<&TableSchema> {
        self.objects.get(object)
    }

    /// Number of objects described by this window.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
