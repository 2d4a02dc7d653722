//! Manifest codec.
//!
//! The manifest is the authoritative description of one window's intent.
//! Rows are parsed once, at entry, into the closed `ManifestRow` variant;
//! downstream code never sees raw CSV records. Unknown operations and
//! missing fields are protocol errors.

use serde::{Deserialize, Serialize};

/// One row of a window manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRow {
    /// Insert-or-replace rows for `object` from `file_path`.
    Upsert {
        /// Target object (table) name.
        object: String,
        /// Staged data file, relative to the window prefix.
        file_path: String,
        /// Digest of the object's schema at extract time.
        schema_fingerprint: String,
        /// Number of data rows in the file.
        row_count: u64,
    },
    /// Delete rows of `object` whose keys appear in `file_path`.
    Delete {
        /// Target object name.
        object: String,
        /// Staged key file, relative to the window prefix.
        file_path: String,
        /// Number of key rows in the file.
        row_count: u64,
    },
    /// Drop the whole object.
    DropTable {
        /// Target object name.
        object: String,
    },
    /// Drop one column.
    DropColumn {
        /// Target object name.
        object: String,
        /// Column to drop.
        column: String,
    },
    /// Add one column (vendor type; mapped downstream).
    AddColumn {
        /// Target object name.
        object: String,
        /// Column to add.
        column: String,
        /// Vendor type of the new column.
        to_type: String,
    },
    /// Change one column's type (vendor types; validated downstream).
    AlterColumn {
        /// Target object name.
        object: String,
        /// Column to alter.
        column: String,
        /// Vendor type before the change.
        from_type: String,
        /// Vendor type after the change.
        to_type: String,
    },
}

impl ManifestRow {
    /// The object this row targets.
    pub fn object(&self) -> &str {
        match self {
            ManifestRow::Upsert { object, .. }
            | ManifestRow::Delete { object, .. }
            | ManifestRow::DropTable { object }
            | ManifestRow::DropColumn { object, .. }
            | ManifestRow::AddColumn { object, .. }
            | ManifestRow::AlterColumn { object, .. } => object,
        }
    }
}

/// Errors produced by the manifest codec.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// CSV-level failure.
    #[error("manifest csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Operation token outside the protocol.
    #[error("unknown manifest operation: {0}")]
    UnknownOperation(String),
    /// A required auxiliary field was empty for the operation.
    #[error("manifest row for {object}: operation {operation} missing {field}")]
    MissingField {
        /// Target object of the offending row.
        object: String,
        /// Operation token of the offending row.
        operation: String,
        /// Name of the missing field.
        field: String,
    },
}

/// Flat record matching the manifest CSV schema.
#[derive(Debug, Serialize, Deserialize)]
struct RawRecord {
    object_name: String,
    operation: String,
    file_path: Option<String>,
    schema_fingerprint: Option<String>,
    row_count: Option<u64>,
    column_name: Option<String>,
    from_type: Option<String>,
    to_type: Option<String>,
}

fn required(
    value: Option<String>,
    object: &str,
    operation: &str,
    field: &'static str,
) -> Result<String, ManifestError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ManifestError::MissingField {
            object: object.to_string(),
            operation: operation.to_string(),
            field: field.to_string(),
        }),
    }
}

/// Parse manifest bytes into typed rows.
pub fn parse_manifest(bytes: &[u8]) -> Result<Vec<ManifestRow>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.deserialize::<RawRecord>() {
        let raw = record?;
        let object = raw.object_name;
        let op = raw.operation;
        let row = match op.as_str() {
            "upsert" => ManifestRow::Upsert {
                file_path: required(raw.file_path, &object, &op, "file_path")?,
                schema_fingerprint: raw.schema_fingerprint.unwrap_or_default(),
                row_count: raw.row_count.unwrap_or(0),
                object,
            },
            "delete" => ManifestRow::Delete {
                file_path: required(raw.file_path, &object, &op, "file_path")?,
                row_count: raw.row_count.unwrap_or(0),
                object,
            },
            "drop_table" => ManifestRow::DropTable { object },
            "drop_column" => ManifestRow::DropColumn {
                column: required(raw.column_name, &object, &op, "column_name")?,
                object,
            },
            "add_column" => ManifestRow::AddColumn {
                column: required(raw.column_name, &object, &op, "column_name")?,
                to_type: required(raw.to_type, &object, &op, "to_type")?,
                object,
            },
            "alter_column" => ManifestRow::AlterColumn {
                column: required(raw.column_name, &object, &op, "column_name")?,
                from_type: required(raw.from_type, &object, &op, "from_type")?,
                to_type: required(raw.to_type, &object, &op, "to_type")?,
                object,
            },
            other => return Err(ManifestError::UnknownOperation(other.to_string())),
        };
        rows.push(row);
    }
    Ok(rows)
}

/// Serialize typed rows back into manifest CSV bytes.
pub fn write_manifest(rows: &[ManifestRow]) -> Result<Vec<u8>, ManifestError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());
    for row in rows {
        let raw = match row {
            ManifestRow::Upsert {
                object,
                file_path,
                schema_fingerprint,
                row_count,
            } => RawRecord {
                object_name: object.clone(),
                operation: "upsert".to_string(),
                file_path: Some(file_path.clone()),
                schema_fingerprint: Some(schema_fingerprint.clone()),
                row_count: Some(*row_count),
                column_name: None,
                from_type: None,
                to_type: None,
            },
            ManifestRow::Delete {
                object,
                file_path,
                row_count,
            } => RawRecord {
                object_name: object.clone(),
                operation: "delete".to_string(),
                file_path: Some(file_path.clone()),
                schema_fingerprint: None,
                row_count: Some(*row_count),
                column_name: None,
                from_type: None,
                to_type: None,
            },
            ManifestRow::DropTable { object } => RawRecord {
                object_name: object.clone(),
                operation: "drop_table".to_string(),
                file_path: None,
                schema_fingerprint: None,
                row_count: None,
                column_name: None,
                from_type: None,
                to_type: None,
            },
            ManifestRow::DropColumn { object, column } => RawRecord {
                object_name: object.clone(),
                operation: "drop_column".to_string(),
                file_path: None,
                schema_fingerprint: None,
                row_count: None,
                column_name: Some(column.clone()),
                from_type: None,
                to_type: None,
            },
            ManifestRow::AddColumn {
                object,
                column,
                to_type,
            } => RawRecord {
                object_name: object.clone(),
                operation: "add_column".to_string(),
                file_path: None,
                schema_fingerprint: None,
                row_count: None,
                column_name: Some(column.clone()),
                from_type: None,
                to_type: Some(to_type.clone()),
            },
            ManifestRow::AlterColumn {
                object,
                column,
                from_type,
                to_type,
            } => RawRecord {
                object_name: object.clone(),
                operation: "alter_column".to_string(),
                file_path: None,
                schema_fingerprint: None,
                row_count: None,
                column_name: Some(column.clone()),
                from_type: Some(from_type.clone()),
                to_type: Some(to_type.clone()),
            },
        };
        writer.serialize(raw)?;
    }
    writer
        .into_inner()
        .map_err(|e| ManifestError::Csv(e.into_error().into()))
}

/// Hex-encoded blake3 digest of manifest bytes; the idempotent
/// re-registration key.
pub fn manifest_checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows() -> Vec<ManifestRow> {
        vec![
            ManifestRow::Upsert {
                object: "account".to_string(),
                file_path: "account_upsert.csv".to_string(),
                schema_fingerprint: "fp-1".to_string(),
                row_count: 120,
            },
            ManifestRow::Delete {
                object: "account".to_string(),
                file_path: "account_delete.csv".to_string(),
                row_count: 3,
            },
            ManifestRow::AddColumn {
                object: "account".to_string(),
                column: "notes".to_string(),
                to_type: "String".to_string(),
            },
            ManifestRow::AlterColumn {
                object: "account".to_string(),
                column: "score".to_string(),
                from_type: "Number".to_string(),
                to_type: "Number".to_string(),
            },
            ManifestRow::DropColumn {
                object: "contact".to_string(),
                column: "fax".to_string(),
            },
            ManifestRow::DropTable {
                object: "legacy_notes".to_string(),
            },
        ]
    }

    #[test]
    fn codec_roundtrip() {
        let rows = sample_rows();
        let bytes = write_manifest(&rows).unwrap();
        let parsed = parse_manifest(&bytes).unwrap();
        assert_eq!(parsed, rows);
    }

    #[test]
    fn unknown_operation_is_a_protocol_error() {
        let bytes = b"object_name,operation,file_path,schema_fingerprint,row_count,column_name,from_type,to_type\naccount,merge,x.csv,,,,,\n";
        let err = parse_manifest(bytes).unwrap_err();
        assert!(matches!(err, ManifestError::UnknownOperation(op) if op == "merge"));
    }

    #[test]
    fn missing_required_field_is_a_protocol_error() {
        let bytes = b"object_name,operation,file_path,schema_fingerprint,row_count,column_name,from_type,to_type\naccount,add_column,,,,notes,,\n";
        let err = parse_manifest(bytes).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::MissingField { ref field, .. } if field == "to_type"
        ));
    }

    #[test]
    fn checksum_is_stable_and_content_sensitive() {
        let a = write_manifest(&sample_rows()).unwrap();
        assert_eq!(manifest_checksum(&a), manifest_checksum(&a));
        let b = write_manifest(&sample_rows()[..1].to_vec()).unwrap();
        assert_ne!(manifest_checksum(&a), manifest_checksum(&b));
    }
}
