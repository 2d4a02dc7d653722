//! Window metadata codec.
//!
//! The vendor archive ships a `metadata.csv` (`metadata_full.csv` for
//! snapshots) enumerating every object's columns and vendor types. The
//! producer normalizes it into this schema when staging; the apply engine
//! reads it back to build the per-window schema registry.

use serde::{Deserialize, Serialize};

use crate::ManifestError;

/// One column of one object, as described by the window's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectColumn {
    /// Owning object (table) name.
    pub object_name: String,
    /// Column name.
    pub column_name: String,
    /// Vendor type token (`String`, `Number`, `Date`, ...).
    pub vendor_type: String,
    /// Whether NULLs are allowed.
    pub nullable: bool,
    /// Whether the column is part of the object's primary key.
    pub is_primary: bool,
    /// Declared maximum length for string-ish types.
    pub max_length: Option<u32>,
}

/// Parse metadata bytes into column rows, in file order.
pub fn parse_metadata(bytes: &[u8]) -> Result<Vec<ObjectColumn>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let mut columns = Vec::new();
    for record in reader.deserialize::<ObjectColumn>() {
        columns.push(record?);
    }
    Ok(columns)
}

/// Serialize column rows into metadata CSV bytes.
pub fn write_metadata(columns: &[ObjectColumn]) -> Result<Vec<u8>, ManifestError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    for column in columns {
        writer.serialize(column)?;
    }
    writer
        .into_inner()
        .map_err(|e| ManifestError::Csv(e.into_error().into()))
}
