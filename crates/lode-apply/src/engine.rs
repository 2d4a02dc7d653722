//! The per-window apply engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use lode_staging::{parse_manifest, parse_metadata, ManifestRow, StagingStore, WindowPrefix};
use lode_types::{Epoch, LoadType, StopTime, VaultId};
use lode_warehouse_core::{ColumnDef, LogicalType, TableSchema, Warehouse, WarehouseTxn};

use crate::schema::{map_vendor_type, transition_allowed, SchemaRegistry};
use crate::{ApplyError, CommitGate};

//─────────────────────────────
//  Requests and outcomes
//─────────────────────────────

/// Everything the engine needs to apply one claimed window.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Owning vault.
    pub vault: VaultId,
    /// Window family.
    pub load_type: LoadType,
    /// Window stop-time.
    pub logical_time: StopTime,
    /// Epoch the entry was claimed under.
    pub epoch: Epoch,
    /// Staging prefix of the window, from the queue entry.
    pub staging_prefix: String,
}

/// Row-level tallies of a committed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    /// Distinct objects that received a COPY.
    pub objects_loaded: usize,
    /// Rows loaded across all objects.
    pub rows_loaded: u64,
    /// Rows removed by the pre-load cleanup.
    pub rows_deleted: u64,
}

/// One staged data file, fetched up front.
struct StagedFile {
    object: String,
    bytes: Vec<u8>,
}

/// One validated DDL statement, planned before any is executed.
enum DdlOp {
    DropTable(String),
    DropColumn { table: String, column: String },
    Create(TableSchema),
    Recreate(TableSchema),
    Add { table: String, column: ColumnDef },
    Alter { table: String, column: String, to: LogicalType },
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Applies one window as one warehouse transaction.
pub struct ApplyEngine {
    staging: Arc<dyn StagingStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl ApplyEngine {
    /// Build an engine over the given staging layer and warehouse.
    pub fn new(staging: Arc<dyn StagingStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { staging, warehouse }
    }

    /// Apply one window. On any failure after BEGIN the transaction is
    /// rolled back and nothing from the window is observable.
    pub async fn apply(
        &self,
        req: &ApplyRequest,
        gate: &dyn CommitGate,
    ) -> Result<ApplyOutcome, ApplyError> {
        let window = WindowPrefix::new(req.vault.clone(), req.load_type, req.logical_time);
        let manifest_key = format!("{}/{}", req.staging_prefix, window.manifest_name());
        let manifest_bytes = self.fetch(&manifest_key).await?.ok_or_else(|| {
            ApplyError::Protocol(format!("manifest missing at {manifest_key}"))
        })?;
        let rows = parse_manifest(&manifest_bytes)?;
        info!(
            vault = %req.vault,
            window = %req.logical_time,
            load_type = %req.load_type,
            manifest_rows = rows.len(),
            "applying window"
        );

        // Fetch every referenced data file up front: sampling needs the
        // bytes, and a manifest referencing a missing file must fail the
        // window before any DDL runs.
        let mut upsert_files = Vec::new();
        let mut delete_files = Vec::new();
        for row in &rows {
            match row {
                ManifestRow::Upsert {
                    object, file_path, ..
                } => upsert_files.push(StagedFile {
                    object: object.clone(),
                    bytes: self.fetch_required(req, file_path).await?,
                }),
                ManifestRow::Delete {
                    object, file_path, ..
                } => delete_files.push(StagedFile {
                    object: object.clone(),
                    bytes: self.fetch_required(req, file_path).await?,
                }),
                _ => {}
            }
        }

        let mut samples: HashMap<String, Vec<u8>> = HashMap::new();
        for file in &upsert_files {
            samples
                .entry(file.object.clone())
                .or_insert_with(|| file.bytes.clone());
        }

        let needs_registry = !upsert_files.is_empty() || !delete_files.is_empty();
        let metadata_key = format!("{}/metadata.csv", req.staging_prefix);
        let registry = match self.fetch(&metadata_key).await? {
            Some(bytes) => SchemaRegistry::build(&parse_metadata(&bytes)?, &samples)?,
            None if needs_registry => {
                return Err(ApplyError::Protocol(format!(
                    "metadata missing at {metadata_key}"
                )))
            }
            None => SchemaRegistry::default(),
        };

        // Validate the whole schema reconciliation before executing any of
        // it; a forbidden transition fails the window with zero DDL issued.
        let plan = self.plan_ddl(req, &rows, &registry).await?;
        self.execute_ddl(&plan).await?;

        let mut txn = self.warehouse.begin().await?;
        let result = self
            .load_phase(req, &registry, &upsert_files, &delete_files, txn.as_mut())
            .await;
        match result {
            Ok(outcome) => {
                if gate.may_commit().await {
                    txn.commit().await?;
                    info!(
                        vault = %req.vault,
                        window = %req.logical_time,
                        objects = outcome.objects_loaded,
                        rows_loaded = outcome.rows_loaded,
                        rows_deleted = outcome.rows_deleted,
                        "window committed"
                    );
                    Ok(outcome)
                } else {
                    warn!(vault = %req.vault, window = %req.logical_time, "lease lost, aborting before commit");
                    txn.rollback().await?;
                    Err(ApplyError::LeaseLost)
                }
            }
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed load also failed");
                }
                Err(err)
            }
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, ApplyError> {
        self.staging
            .get(key)
            .await
            .map_err(|e| ApplyError::Staging(e.to_string()))
    }

    async fn fetch_required(
        &self,
        req: &ApplyRequest,
        file_path: &str,
    ) -> Result<Vec<u8>, ApplyError> {
        let key = format!("{}/{file_path}", req.staging_prefix);
        self.fetch(&key).await?.ok_or_else(|| {
            ApplyError::Protocol(format!("manifest references missing file {key}"))
        })
    }

    //───────────────────── schema reconciliation ─────────────────────

    async fn plan_ddl(
        &self,
        req: &ApplyRequest,
        rows: &[ManifestRow],
        registry: &SchemaRegistry,
    ) -> Result<Vec<DdlOp>, ApplyError> {
        let mut plan = Vec::new();

        for row in rows {
            match row {
                ManifestRow::DropTable { object } => {
                    plan.push(DdlOp::DropTable(object.clone()));
                }
                ManifestRow::DropColumn { object, column } => {
                    plan.push(DdlOp::DropColumn {
                        table: object.clone(),
                        column: column.clone(),
                    });
                }
                _ => {}
            }
        }

        // Objects carrying data rows reconcile live columns against the
        // window's metadata schema.
        let mut reconcile: Vec<String> = Vec::new();
        for row in rows {
            if let ManifestRow::Upsert { object, .. } = row {
                if !reconcile.contains(object) {
                    reconcile.push(object.clone());
                }
            }
        }
        for object in &reconcile {
            let target = registry.object(object).ok_or_else(|| {
                ApplyError::Protocol(format!("no metadata for object {object}"))
            })?;
            match self.warehouse.table_columns(object).await? {
                None => plan.push(DdlOp::Create(target.clone())),
                Some(live) => {
                    if req.load_type == LoadType::Full {
                        if live != target.columns {
                            plan.push(DdlOp::Recreate(target.clone()));
                        }
                    } else {
                        self.plan_column_diff(object, &live, target, &mut plan)?;
                    }
                }
            }
        }

        // Explicit column operations for objects without data rows in this
        // window (pure schema windows).
        for row in rows {
            match row {
                ManifestRow::AddColumn {
                    object,
                    column,
                    to_type,
                } if !reconcile.contains(object) => {
                    let live = self.warehouse.table_columns(object).await?.ok_or_else(|| {
                        ApplyError::Protocol(format!("add_column on unknown table {object}"))
                    })?;
                    if live.iter().any(|c| &c.name == column) {
                        continue;
                    }
                    let logical_type = registry
                        .object(object)
                        .and_then(|s| s.column(column))
                        .map(|c| c.logical_type.clone())
                        .unwrap_or_else(|| map_vendor_type(to_type, None, false));
                    plan.push(DdlOp::Add {
                        table: object.clone(),
                        column: ColumnDef {
                            name: column.clone(),
                            logical_type,
                            nullable: true,
                        },
                    });
                }
                ManifestRow::AlterColumn {
                    object,
                    column,
                    to_type,
                    ..
                } if !reconcile.contains(object) => {
                    let live = self.warehouse.table_columns(object).await?.ok_or_else(|| {
                        ApplyError::Protocol(format!("alter_column on unknown table {object}"))
                    })?;
                    let live_col = live.iter().find(|c| &c.name == column).ok_or_else(|| {
                        ApplyError::Protocol(format!(
                            "alter_column on unknown column {object}.{column}"
                        ))
                    })?;
                    let to = registry
                        .object(object)
                        .and_then(|s| s.column(column))
                        .map(|c| c.logical_type.clone())
                        .unwrap_or_else(|| map_vendor_type(to_type, None, false));
                    if live_col.logical_type == to {
                        continue;
                    }
                    if !transition_allowed(&live_col.logical_type, &to) {
                        return Err(ApplyError::IncompatibleSchemaChange {
                            object: object.clone(),
                            column: column.clone(),
                            from: live_col.logical_type.clone(),
                            to,
                        });
                    }
                    plan.push(DdlOp::Alter {
                        table: object.clone(),
                        column: column.clone(),
                        to,
                    });
                }
                _ => {}
            }
        }

        Ok(plan)
    }

    fn plan_column_diff(
        &self,
        object: &str,
        live: &[ColumnDef],
        target: &TableSchema,
        plan: &mut Vec<DdlOp>,
    ) -> Result<(), ApplyError> {
        for col in &target.columns {
            match live.iter().find(|l| l.name == col.name) {
                None => plan.push(DdlOp::Add {
                    table: object.to_string(),
                    column: col.clone(),
                }),
                Some(live_col) if live_col.logical_type != col.logical_type => {
                    if transition_allowed(&live_col.logical_type, &col.logical_type) {
                        plan.push(DdlOp::Alter {
                            table: object.to_string(),
                            column: col.name.clone(),
                            to: col.logical_type.clone(),
                        });
                    } else if transition_allowed(&col.logical_type, &live_col.logical_type) {
                        // The live column is already wider than this
                        // window's sample suggests (decimal sniffing is
                        // per-window); the values load as-is, no DDL.
                    } else {
                        return Err(ApplyError::IncompatibleSchemaChange {
                            object: object.to_string(),
                            column: col.name.clone(),
                            from: live_col.logical_type.clone(),
                            to: col.logical_type.clone(),
                        });
                    }
                }
                Some(_) => {}
            }
        }
        // Live columns absent from the target are only removed by explicit
        // drop_column rows.
        Ok(())
    }

    async fn execute_ddl(&self, plan: &[DdlOp]) -> Result<(), ApplyError> {
        for op in plan {
            match op {
                DdlOp::DropTable(table) => {
                    debug!(%table, "ddl: drop table");
                    self.warehouse.drop_table(table).await?;
                }
                DdlOp::DropColumn { table, column } => {
                    // The table may have been dropped earlier in this plan.
                    if self.warehouse.table_columns(table).await?.is_none() {
                        continue;
                    }
                    debug!(%table, %column, "ddl: drop column");
                    self.warehouse.drop_column(table, column).await?;
                }
                DdlOp::Create(schema) => {
                    debug!(table = %schema.table, "ddl: create table");
                    self.warehouse.create_table(schema).await?;
                }
                DdlOp::Recreate(schema) => {
                    debug!(table = %schema.table, "ddl: drop and recreate table");
                    self.warehouse.drop_table(&schema.table).await?;
                    self.warehouse.create_table(schema).await?;
                }
                DdlOp::Add { table, column } => {
                    debug!(%table, column = %column.name, "ddl: add column");
                    self.warehouse.add_column(table, column).await?;
                }
                DdlOp::Alter { table, column, to } => {
                    debug!(%table, %column, new_type = %to, "ddl: alter column type");
                    self.warehouse.alter_column_type(table, column, to).await?;
                }
            }
        }
        Ok(())
    }

    //───────────────────── transactional load ─────────────────────

    async fn load_phase(
        &self,
        req: &ApplyRequest,
        registry: &SchemaRegistry,
        upsert_files: &[StagedFile],
        delete_files: &[StagedFile],
        txn: &mut dyn WarehouseTxn,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mut outcome = ApplyOutcome::default();

        match req.load_type {
            LoadType::Incr => {
                // Delete every key named by the window, whether it comes
                // from a delete file or rides in as the old version of an
                // upsert row.
                let mut keys_by_object: HashMap<String, Vec<Vec<String>>> = HashMap::new();
                for file in delete_files.iter().chain(upsert_files) {
                    let schema = self.object_schema(registry, &file.object)?;
                    keys_by_object
                        .entry(file.object.clone())
                        .or_default()
                        .extend(key_rows(&file.bytes, &schema.key_columns)?);
                }
                for (object, keys) in &keys_by_object {
                    let schema = self.object_schema(registry, object)?;
                    outcome.rows_deleted += txn
                        .delete_where_key_in(object, &schema.key_columns, keys)
                        .await?;
                }
            }
            LoadType::Full => {
                let mut truncated = HashSet::new();
                for file in upsert_files {
                    if truncated.insert(file.object.clone()) {
                        txn.truncate(&file.object).await?;
                    }
                }
            }
            // LOG windows are append-only.
            LoadType::Log => {}
        }

        let mut objects = HashSet::new();
        for file in upsert_files {
            let schema = self.object_schema(registry, &file.object)?;
            outcome.rows_loaded += txn
                .copy_csv(&file.object, &schema.column_names(), &file.bytes)
                .await?;
            objects.insert(file.object.clone());
        }
        outcome.objects_loaded = objects.len();
        Ok(outcome)
    }

    fn object_schema<'a>(
        &self,
        registry: &'a SchemaRegistry,
        object: &str,
    ) -> Result<&'a TableSchema, ApplyError> {
        registry
            .object(object)
            .ok_or_else(|| ApplyError::Protocol(format!("no metadata for object {object}")))
    }
}

/// Extract key tuples from a staged CSV, in file order.
fn key_rows(bytes: &[u8], key_columns: &[String]) -> Result<Vec<Vec<String>>, ApplyError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| ApplyError::Protocol(format!("unreadable data header: {e}")))?
        .clone();
    let mut indexes = Vec::with_capacity(key_columns.len());
    for key in key_columns {
        let idx = headers
            .iter()
            .position(|h| h == key)
            .ok_or_else(|| ApplyError::Protocol(format!("file missing key column {key}")))?;
        indexes.push(idx);
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| ApplyError::Protocol(format!("bad data record: {e}")))?;
        rows.push(
            indexes
                .iter()
                .map(|&i| record.get(i).unwrap_or_default().to_string())
                .collect(),
        );
    }
    Ok(rows)
}
