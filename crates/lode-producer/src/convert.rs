//! Optional typed normalization of staged CSVs.
//!
//! When `convert_to_columnar` is set, staged data files are re-encoded in
//! bounded chunks applying the type-mapping rules: booleans canonicalized,
//! numeric and temporal values trimmed. The container format stays CSV;
//! the warehouse COPY contract consumes it directly.

use lode_staging::{MultipartWriter, StagingStore};
use lode_warehouse_core::{LogicalType, TableSchema};

use crate::ProducerError;

/// Rows per re-encoded chunk.
pub const CHUNK_ROWS: usize = 100_000;

fn staging_err(e: impl std::fmt::Display) -> ProducerError {
    ProducerError::Staging(e.to_string())
}

fn csv_err(e: impl std::fmt::Display) -> ProducerError {
    ProducerError::Archive(format!("csv: {e}"))
}

/// Canonical form of one field under its logical type.
fn normalize_value(value: &str, logical_type: Option<&LogicalType>) -> String {
    let Some(logical_type) = logical_type else {
        return value.to_string();
    };
    if value.is_empty() {
        return String::new();
    }
    match logical_type {
        LogicalType::Bool => {
            let trimmed = value.trim();
            if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
                "true".to_string()
            } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
                "false".to_string()
            } else {
                trimmed.to_string()
            }
        }
        LogicalType::Int64
        | LogicalType::Float64
        | LogicalType::Date
        | LogicalType::TimestampUtc => value.trim().to_string(),
        LogicalType::Utf8 { .. } => value.to_string(),
    }
}

/// Re-encode the staged file at `key` in place, `CHUNK_ROWS` rows at a
/// time. Returns the number of data rows written.
pub async fn normalize_file(
    staging: &dyn StagingStore,
    key: &str,
    schema: &TableSchema,
) -> Result<u64, ProducerError> {
    let reader = staging
        .open_read(key)
        .await
        .map_err(staging_err)?
        .ok_or_else(|| ProducerError::Staging(format!("missing staged file {key}")))?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);
    let headers = csv_reader.headers().map_err(csv_err)?.clone();
    let types: Vec<Option<LogicalType>> = headers
        .iter()
        .map(|h| schema.column(h).map(|c| c.logical_type.clone()))
        .collect();

    let mut writer = staging.start_multipart(key).await.map_err(staging_err)?;
    match pump_rows(&mut csv_reader, &headers, &types, writer.as_mut()).await {
        Ok(rows) => {
            writer.complete().await.map_err(staging_err)?;
            Ok(rows)
        }
        Err(e) => {
            let _ = writer.abort().await;
            Err(e)
        }
    }
}

async fn pump_rows(
    csv_reader: &mut csv::Reader<Box<dyn std::io::Read + Send>>,
    headers: &csv::StringRecord,
    types: &[Option<LogicalType>],
    writer: &mut dyn MultipartWriter,
) -> Result<u64, ProducerError> {
    let mut chunk = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    chunk.write_record(headers).map_err(csv_err)?;

    let mut rows = 0u64;
    let mut chunk_rows = 0usize;
    for record in csv_reader.records() {
        let record = record.map_err(csv_err)?;
        let normalized: Vec<String> = record
            .iter()
            .zip(types)
            .map(|(value, ty)| normalize_value(value, ty.as_ref()))
            .collect();
        chunk.write_record(&normalized).map_err(csv_err)?;
        rows += 1;
        chunk_rows += 1;
        if chunk_rows >= CHUNK_ROWS {
            let bytes = chunk
                .into_inner()
                .map_err(|e| csv_err(e.into_error()))?;
            writer.write_chunk(&bytes).await.map_err(staging_err)?;
            chunk = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            chunk_rows = 0;
        }
    }
    let bytes = chunk.into_inner().map_err(|e| csv_err(e.into_error()))?;
    if !bytes.is_empty() {
        writer.write_chunk(&bytes).await.map_err(staging_err)?;
    }
    Ok(rows)
}
