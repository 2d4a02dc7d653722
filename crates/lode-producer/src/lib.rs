#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-producer** – Producer for the Lode control plane.
//!
//! One tick pulls the windows the vendor has made available since the
//! vault's watermark, stages each one (archive download, extraction,
//! metadata normalization, optional typed conversion), and registers a
//! READY queue entry. Registration is idempotent on the manifest
//! checksum, and the manifest is always the last object written to a
//! window prefix, so a crash at any point leaves either a re-stageable
//! partial prefix or a complete, registerable one.
//!
//! The producer never advances any watermark and never blocks on
//! downstream state: failures are absorbed (logged, retried next tick)
//! except protocol errors, which are alerted and surfaced.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use lode_apply::SchemaRegistry;
use lode_staging::{
    manifest_checksum, parse_manifest, parse_metadata, write_manifest, write_metadata,
    ManifestRow, MultipartWriter, StagingStore, WindowPrefix,
};
use lode_store_core::{
    with_retries, Alert, ControlPlaneStore, Registration, RetryPolicy, Severity, StoreError,
};
use lode_types::{LoadType, LodeConfig, QueueEntry, StopTime, VaultId, VaultState};

pub mod convert;
pub mod extract;
pub mod feed;

pub use extract::{DataFile, ExtractSummary};
pub use feed::{DirectoryFeed, PartStream, VendorFeed, WindowDescriptor};

//─────────────────────────────
//  Errors and reports
//─────────────────────────────

/// Errors surfaced by a producer tick.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    /// Control-plane store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Vendor feed failure.
    #[error("vendor feed error: {0}")]
    Feed(String),

    /// Staging layer failure.
    #[error("staging error: {0}")]
    Staging(String),

    /// The archive could not be read.
    #[error("archive error: {0}")]
    Archive(String),

    /// The window violates the feed protocol.
    #[error("window {window}: {reason}")]
    BadWindow {
        /// Stop-time of the offending window.
        window: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl ProducerError {
    /// Whether this failure is a protocol error that needs an operator
    /// rather than a retry.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ProducerError::BadWindow { .. }
                | ProducerError::Store(StoreError::ChecksumMismatch { .. })
        )
    }
}

/// Tallies of one producer tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    /// Windows the vendor advertised.
    pub listed: usize,
    /// Windows dropped (zero rows or at/behind the watermark).
    pub skipped: usize,
    /// New entries registered READY.
    pub registered: usize,
    /// Entries that were already registered (idempotent retry).
    pub already_registered: usize,
}

/// Producer-side configuration, derived from [`LodeConfig`].
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Tenant this producer serves.
    pub vault: VaultId,
    /// Window family to extract.
    pub extract_type: LoadType,
    /// On first run, look back instead of starting from the epoch of time.
    pub use_dynamic_window: bool,
    /// Lookback horizon in hours.
    pub dynamic_lookback_hours: u32,
    /// Re-encode staged CSVs with typed normalization.
    pub convert_to_columnar: bool,
}

impl ProducerConfig {
    /// Derive from process configuration.
    pub fn from_config(config: &LodeConfig) -> Result<Self, String> {
        Ok(Self {
            vault: VaultId::new(config.vault_id.clone())?,
            extract_type: config.extract_type,
            use_dynamic_window: config.use_dynamic_window,
            dynamic_lookback_hours: config.dynamic_lookback_hours,
            convert_to_columnar: config.convert_to_columnar,
        })
    }
}

//─────────────────────────────
//  Producer
//─────────────────────────────

/// Stages vendor windows and registers them with the control plane.
pub struct Producer {
    feed: Arc<dyn VendorFeed>,
    staging: Arc<dyn StagingStore>,
    store: Arc<dyn ControlPlaneStore>,
    alert: Arc<dyn Alert>,
    retry: RetryPolicy,
    config: ProducerConfig,
}

impl Producer {
    /// Build a producer over its collaborators.
    pub fn new(
        feed: Arc<dyn VendorFeed>,
        staging: Arc<dyn StagingStore>,
        store: Arc<dyn ControlPlaneStore>,
        alert: Arc<dyn Alert>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            feed,
            staging,
            store,
            alert,
            retry: RetryPolicy::default(),
            config,
        }
    }

    /// Run one producer tick.
    pub async fn tick(&self) -> Result<ProducerReport, ProducerError> {
        let state = self.ensure_vault_state().await?;
        let watermark = match self.config.extract_type {
            LoadType::Log => state.log_watermark,
            LoadType::Incr | LoadType::Full => state.last_applied_stoptime,
        };
        let from = watermark.or_else(|| {
            self.config.use_dynamic_window.then(|| {
                StopTime::from_datetime(
                    Utc::now()
                        - chrono::Duration::hours(i64::from(self.config.dynamic_lookback_hours)),
                )
            })
        });

        let mut windows = self
            .feed
            .list_windows(self.config.extract_type, from)
            .await
            .map_err(|e| ProducerError::Feed(e.to_string()))?;

        let mut report = ProducerReport {
            listed: windows.len(),
            ..ProducerReport::default()
        };
        windows.retain(|w| {
            if w.row_count == 0 {
                debug!(window = %w.logical_time, "dropping zero-row window");
                report.skipped += 1;
                return false;
            }
            if matches!(watermark, Some(wm) if w.logical_time <= wm) {
                debug!(window = %w.logical_time, "dropping window at or behind watermark");
                report.skipped += 1;
                return false;
            }
            true
        });
        windows.sort_by_key(|w| w.logical_time);

        for window in &windows {
            match self.stage_and_register(window).await {
                Ok(Registration::Created) => report.registered += 1,
                Ok(Registration::AlreadyRegistered) => report.already_registered += 1,
                Err(err) if err.is_protocol() => {
                    self.alert
                        .fire(
                            Severity::Error,
                            "window registration protocol error",
                            &err.to_string(),
                        )
                        .await;
                    return Err(err);
                }
                Err(err) => {
                    // Later windows must not register ahead of this one;
                    // the whole tail is retried next tick.
                    warn!(
                        window = %window.logical_time,
                        error = %err,
                        "window staging failed, deferring remaining windows to next tick"
                    );
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn ensure_vault_state(&self) -> Result<VaultState, ProducerError> {
        if let Some(state) = self.store.get_vault_state(&self.config.vault).await? {
            return Ok(state);
        }
        self.store
            .init_vault_state(&self.config.vault, VaultState::default())
            .await?;
        Ok(self
            .store
            .get_vault_state(&self.config.vault)
            .await?
            .unwrap_or_default())
    }

    async fn stage_and_register(
        &self,
        descriptor: &WindowDescriptor,
    ) -> Result<Registration, ProducerError> {
        let window = WindowPrefix::new(
            self.config.vault.clone(),
            descriptor.load_type,
            descriptor.logical_time,
        );

        // Idempotent fast path: a manifest at the prefix means staging
        // completed earlier; only the registration may be missing.
        if let Some(manifest) = self
            .staging
            .get(&window.manifest_key())
            .await
            .map_err(|e| ProducerError::Staging(e.to_string()))?
        {
            return self
                .register(descriptor, manifest_checksum(&manifest), window.prefix())
                .await;
        }

        // Stream all archive parts into one staged object.
        let archive_key = window.data_key("archive.tar");
        let mut writer = self
            .staging
            .start_multipart(&archive_key)
            .await
            .map_err(|e| ProducerError::Staging(e.to_string()))?;
        match self.pump_parts(descriptor, writer.as_mut()).await {
            Ok(()) => writer
                .complete()
                .await
                .map_err(|e| ProducerError::Staging(e.to_string()))?,
            Err(e) => {
                let _ = writer.abort().await;
                return Err(e);
            }
        }

        let summary =
            extract::extract_window(self.staging.as_ref(), &window, &archive_key).await?;

        // Normalize and stage the metadata.
        let columns = match &summary.metadata {
            Some(bytes) => {
                let columns =
                    parse_metadata(bytes).map_err(|e| self.bad_window(descriptor, e))?;
                self.staging
                    .put(
                        &window.metadata_key(),
                        &write_metadata(&columns).map_err(|e| self.bad_window(descriptor, e))?,
                    )
                    .await
                    .map_err(|e| ProducerError::Staging(e.to_string()))?;
                Some(columns)
            }
            None if !summary.data_files.is_empty() => {
                return Err(self.bad_window(descriptor, "archive has data files but no metadata"))
            }
            None => None,
        };

        if self.config.convert_to_columnar {
            if let Some(columns) = &columns {
                self.convert_window(&window, &summary, columns).await?;
            }
        }

        // Normalize the manifest; synthesize one from the file names when
        // the vendor archive did not carry one.
        let rows = match &summary.vendor_manifest {
            Some(bytes) => parse_manifest(bytes).map_err(|e| self.bad_window(descriptor, e))?,
            None => synthesize_manifest(&summary)
                .map_err(|reason| self.bad_window(descriptor, reason))?,
        };
        for row in &rows {
            if let ManifestRow::Upsert { file_path, .. } | ManifestRow::Delete { file_path, .. } =
                row
            {
                let staged = self
                    .staging
                    .exists(&window.data_key(file_path))
                    .await
                    .map_err(|e| ProducerError::Staging(e.to_string()))?;
                if !staged {
                    return Err(self.bad_window(
                        descriptor,
                        format!("manifest references unstaged file {file_path}"),
                    ));
                }
            }
        }

        // The manifest is the atomicity marker: written last, after every
        // file it references.
        let manifest_bytes =
            write_manifest(&rows).map_err(|e| self.bad_window(descriptor, e))?;
        self.staging
            .put(&window.manifest_key(), &manifest_bytes)
            .await
            .map_err(|e| ProducerError::Staging(e.to_string()))?;

        self.register(descriptor, manifest_checksum(&manifest_bytes), window.prefix())
            .await
    }

    async fn pump_parts(
        &self,
        descriptor: &WindowDescriptor,
        writer: &mut dyn MultipartWriter,
    ) -> Result<(), ProducerError> {
        for part in &descriptor.parts {
            let mut stream = self
                .feed
                .fetch_part(descriptor, part)
                .await
                .map_err(|e| ProducerError::Feed(e.to_string()))?;
            while let Some(chunk) = stream
                .next_chunk()
                .await
                .map_err(|e| ProducerError::Feed(e.to_string()))?
            {
                writer
                    .write_chunk(&chunk)
                    .await
                    .map_err(|e| ProducerError::Staging(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn convert_window(
        &self,
        window: &WindowPrefix,
        summary: &ExtractSummary,
        columns: &[lode_staging::ObjectColumn],
    ) -> Result<(), ProducerError> {
        let mut samples = std::collections::HashMap::new();
        for file in &summary.data_files {
            if let Some(object) = file.name.strip_suffix("_upsert.csv") {
                if let Some(bytes) = self
                    .staging
                    .get(&window.data_key(&file.name))
                    .await
                    .map_err(|e| ProducerError::Staging(e.to_string()))?
                {
                    samples.insert(object.to_string(), bytes);
                }
            }
        }
        let registry = SchemaRegistry::build(columns, &samples)
            .map_err(|e| ProducerError::Archive(e.to_string()))?;
        for file in &summary.data_files {
            let object = file
                .name
                .strip_suffix("_upsert.csv")
                .or_else(|| file.name.strip_suffix("_delete.csv"));
            let Some(object) = object else { continue };
            let Some(schema) = registry.object(object) else {
                continue;
            };
            let rows =
                convert::normalize_file(self.staging.as_ref(), &window.data_key(&file.name), schema)
                    .await?;
            debug!(file = %file.name, rows, "normalized staged file");
        }
        Ok(())
    }

    async fn register(
        &self,
        descriptor: &WindowDescriptor,
        checksum: String,
        prefix: String,
    ) -> Result<Registration, ProducerError> {
        // Re-read the epoch at the last moment; a full-load trigger may
        // have bumped it since the tick started.
        let state = self
            .store
            .get_vault_state(&self.config.vault)
            .await?
            .unwrap_or_default();
        let entry = QueueEntry::ready(
            self.config.vault.clone(),
            descriptor.load_type,
            descriptor.logical_time,
            prefix,
            checksum,
            state.current_epoch,
        );
        let sort_key = entry.sort_key();
        let registration = with_retries(&self.retry, "register window", || {
            self.store.put_if_absent(entry.clone())
        })
        .await?;
        match registration {
            Registration::Created => {
                info!(vault = %self.config.vault, %sort_key, "registered window READY")
            }
            Registration::AlreadyRegistered => {
                debug!(vault = %self.config.vault, %sort_key, "window already registered")
            }
        }
        Ok(registration)
    }

    fn bad_window(
        &self,
        descriptor: &WindowDescriptor,
        reason: impl std::fmt::Display,
    ) -> ProducerError {
        ProducerError::BadWindow {
            window: descriptor.logical_time.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Build manifest rows from extracted file names when the archive carries
/// no manifest of its own.
fn synthesize_manifest(summary: &ExtractSummary) -> Result<Vec<ManifestRow>, String> {
    let mut rows = Vec::new();
    for file in &summary.data_files {
        if let Some(object) = file.name.strip_suffix("_upsert.csv") {
            rows.push(ManifestRow::Upsert {
                object: object.to_string(),
                file_path: file.name.clone(),
                schema_fingerprint: String::new(),
                row_count: file.rows,
            });
        } else if let Some(object) = file.name.strip_suffix("_delete.csv") {
            rows.push(ManifestRow::Delete {
                object: object.to_string(),
                file_path: file.name.clone(),
                row_count: file.rows,
            });
        } else {
            warn!(file = %file.name, "cannot infer manifest operation for file, omitting");
        }
    }
    if rows.is_empty() {
        return Err("archive carries neither a manifest nor recognizable data files".to_string());
    }
    Ok(rows)
}
