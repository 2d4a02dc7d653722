#![forbid(unsafe_code)]

//! **lode-cli** – Operator command-line interface for Lode.
//!
//! Every flag is env-backed so the same binary runs as a scheduled
//! producer tick, an event-driven consumer daemon, or an operator's
//! one-shot command. Exit codes: 0 success, 2 precondition failure,
//! 3 transient store error, 4 protocol error, 1 anything else.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lode_apply::ApplyEngine;
use lode_consumer::{
    reset_failed, run_daemon, trigger_full, Consumer, ConsumerConfig, ConsumerError, Outcome,
    TriggerError,
};
use lode_producer::{DirectoryFeed, Producer, ProducerConfig, ProducerError};
use lode_staging::{LocalFsStaging, StagingStore};
use lode_store_core::{ControlPlaneStore, StoreError, TracingAlert};
use lode_store_memory::MemoryStore;
use lode_store_sled::SledStore;
use lode_types::{LoadType, LodeConfig, StopTime, StoreBackend, VaultId};
use lode_warehouse_core::Warehouse;
use lode_warehouse_memory::MemoryWarehouse;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "lode")]
#[command(about = "Lode - incremental ELT control plane")]
#[command(version)]
struct Cli {
    /// Vault (tenant) identifier
    #[arg(long, env = "VAULT_ID")]
    vault: String,

    /// Control-plane store backend (memory, sled)
    #[arg(long, env = "STORE_BACKEND", default_value = "sled")]
    store: String,

    /// Path of the sled store
    #[arg(long, env = "STORE_PATH", default_value = "lode-store")]
    store_path: PathBuf,

    /// Queue table name
    #[arg(long, env = "QUEUE_TABLE_NAME", default_value = "queue")]
    queue_table: String,

    /// Vault-state table name
    #[arg(long, env = "STATE_TABLE_NAME", default_value = "vault_state")]
    state_table: String,

    /// Root of the object staging layer
    #[arg(long, env = "OBJECT_STORE_ROOT", default_value = "lode-staging")]
    staging_root: PathBuf,

    /// Warehouse DSN; `memory:` selects the in-memory driver
    #[arg(long, env = "WAREHOUSE_DSN", default_value = "memory:")]
    warehouse_dsn: String,

    /// Window family this process extracts/consumes (INCR, LOG, FULL)
    #[arg(long, env = "EXTRACT_TYPE", default_value = "INCR")]
    extract_type: String,

    /// Use a dynamic lookback window on first run
    #[arg(long, env = "USE_DYNAMIC_WINDOW")]
    use_dynamic_window: bool,

    /// Lookback horizon in hours for the dynamic first-run window
    #[arg(long, env = "DYNAMIC_LOOKBACK_HOURS", default_value_t = 24)]
    dynamic_lookback_hours: u32,

    /// Re-encode staged CSVs with typed normalization
    #[arg(long, env = "CONVERT_TO_COLUMNAR")]
    convert_to_columnar: bool,

    /// Claim attempts before a crashed PROCESSING entry needs an operator
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Consumer lease TTL in seconds
    #[arg(long, env = "LEASE_TTL_SECS", default_value_t = 900)]
    lease_ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one producer tick against a vendor feed directory
    Produce {
        /// Directory holding vendor window archives
        #[arg(long, env = "FEED_ROOT")]
        feed_root: PathBuf,
    },
    /// Run one consumer drive loop
    Consume,
    /// Run the event-driven consumer daemon
    Daemon {
        /// Safety-tick interval in seconds
        #[arg(long, default_value_t = 60)]
        poll_secs: u64,
    },
    /// Reset a FAILED entry back to READY
    ResetFailed {
        /// Stop-time key of the window (YYYYMMDDHHMM for INCR,
        /// YYYYMMDD for LOG/FULL)
        #[arg(long)]
        stoptime: String,
    },
    /// Trigger a full-snapshot load and rewind the control plane
    TriggerFull {
        /// Snapshot date (YYYY-MM-DD)
        #[arg(long)]
        snapshot_date: NaiveDate,
    },
    /// Print vault state and queue as JSON
    ShowState,
}

/// A consumer run that marked a window FAILED.
#[derive(Debug, thiserror::Error)]
#[error("window {sort_key} failed: {error}")]
struct FailedWindow {
    sort_key: String,
    error: String,
    protocol: bool,
}

//─────────────────────────────
//  Main
//─────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli.log_level) {
        eprintln!("failed to initialize tracing: {e}");
        return ExitCode::from(1);
    }
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("command failed: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow!("tracing init: {e}"))
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return store_code(e);
    }
    if let Some(e) = err.downcast_ref::<ProducerError>() {
        return match e {
            ProducerError::Store(s) => store_code(s),
            ProducerError::BadWindow { .. } => 4,
            _ => 1,
        };
    }
    if let Some(e) = err.downcast_ref::<ConsumerError>() {
        return match e {
            ConsumerError::Store(s) => store_code(s),
            ConsumerError::UninitializedVault(_) => 2,
        };
    }
    if let Some(e) = err.downcast_ref::<TriggerError>() {
        return match e {
            TriggerError::Store(s) => store_code(s),
            TriggerError::Staging(_) => 1,
        };
    }
    if let Some(e) = err.downcast_ref::<FailedWindow>() {
        return if e.protocol { 4 } else { 1 };
    }
    1
}

fn store_code(err: &StoreError) -> u8 {
    match err {
        StoreError::PreconditionFailed(_) | StoreError::NotFound(_) => 2,
        StoreError::Transient(_) => 3,
        StoreError::ChecksumMismatch { .. } => 4,
        StoreError::Corrupt(_) => 1,
    }
}

//─────────────────────────────
//  Wiring
//─────────────────────────────

struct Components {
    vault: VaultId,
    config: LodeConfig,
    store: Arc<dyn ControlPlaneStore>,
    staging: Arc<dyn StagingStore>,
    warehouse: Arc<dyn Warehouse>,
}

fn lode_config(cli: &Cli) -> Result<LodeConfig> {
    Ok(LodeConfig {
        vault_id: cli.vault.clone(),
        state_table_name: cli.state_table.clone(),
        queue_table_name: cli.queue_table.clone(),
        object_store_root: cli.staging_root.clone(),
        warehouse_dsn: cli.warehouse_dsn.clone(),
        extract_type: cli.extract_type.parse().map_err(|e: String| anyhow!(e))?,
        use_dynamic_window: cli.use_dynamic_window,
        dynamic_lookback_hours: cli.dynamic_lookback_hours,
        convert_to_columnar: cli.convert_to_columnar,
        max_attempts: cli.max_attempts,
        store_backend: cli.store.parse().map_err(|e: String| anyhow!(e))?,
        store_path: cli.store_path.clone(),
        lease_ttl: Duration::from_secs(cli.lease_ttl_secs),
    })
}

fn build_components(cli: &Cli) -> Result<Components> {
    let config = lode_config(cli)?;
    let vault = VaultId::new(config.vault_id.clone()).map_err(|e| anyhow!(e))?;
    let store: Arc<dyn ControlPlaneStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sled => Arc::new(SledStore::open_with_tables(
            &config.store_path,
            &config.queue_table_name,
            &config.state_table_name,
            "leases",
        )?),
    };
    let staging: Arc<dyn StagingStore> = Arc::new(
        LocalFsStaging::new(config.object_store_root.clone())
            .with_context(|| format!("staging root {}", config.object_store_root.display()))?,
    );
    let warehouse: Arc<dyn Warehouse> = if config.warehouse_dsn == "memory:" {
        Arc::new(MemoryWarehouse::new())
    } else {
        bail!(
            "unsupported warehouse dsn {:?}: only the memory: driver is wired into this binary",
            config.warehouse_dsn
        );
    };
    Ok(Components {
        vault,
        config,
        store,
        staging,
        warehouse,
    })
}

fn consumer(parts: &Components) -> Result<Consumer> {
    let engine = ApplyEngine::new(Arc::clone(&parts.staging), Arc::clone(&parts.warehouse));
    Ok(Consumer::new(
        Arc::clone(&parts.store),
        engine,
        Arc::new(TracingAlert),
        ConsumerConfig::from_config(&parts.config).map_err(|e| anyhow!(e))?,
    ))
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn run(cli: Cli) -> Result<()> {
    let parts = build_components(&cli)?;
    match &cli.command {
        Commands::Produce { feed_root } => handle_produce(&parts, feed_root).await,
        Commands::Consume => handle_consume(&parts).await,
        Commands::Daemon { poll_secs } => handle_daemon(&parts, *poll_secs).await,
        Commands::ResetFailed { stoptime } => handle_reset(&parts, stoptime).await,
        Commands::TriggerFull { snapshot_date } => {
            handle_trigger_full(&parts, *snapshot_date).await
        }
        Commands::ShowState => handle_show_state(&parts).await,
    }
}

async fn handle_produce(parts: &Components, feed_root: &PathBuf) -> Result<()> {
    let producer = Producer::new(
        Arc::new(DirectoryFeed::new(feed_root.clone())),
        Arc::clone(&parts.staging),
        Arc::clone(&parts.store),
        Arc::new(TracingAlert),
        ProducerConfig::from_config(&parts.config).map_err(|e| anyhow!(e))?,
    );
    let report = producer.tick().await?;
    info!(
        listed = report.listed,
        skipped = report.skipped,
        registered = report.registered,
        already_registered = report.already_registered,
        "producer tick complete"
    );
    println!(
        "listed {} / skipped {} / registered {} / already registered {}",
        report.listed, report.skipped, report.registered, report.already_registered
    );
    Ok(())
}

async fn handle_consume(parts: &Components) -> Result<()> {
    let consumer = consumer(parts)?;
    match consumer.run_once().await? {
        Outcome::Drained { applied } => {
            println!("queue drained, {applied} window(s) applied");
            Ok(())
        }
        Outcome::AnotherOwner => {
            println!("another runner owns the lease, nothing to do");
            Ok(())
        }
        Outcome::Blocked { reason } => {
            println!("queue blocked: {reason}");
            Ok(())
        }
        Outcome::Failed {
            sort_key,
            error,
            protocol,
        } => Err(FailedWindow {
            sort_key,
            error,
            protocol,
        }
        .into()),
    }
}

async fn handle_daemon(parts: &Components, poll_secs: u64) -> Result<()> {
    let consumer = consumer(parts)?;
    tokio::select! {
        result = run_daemon(&consumer, Duration::from_secs(poll_secs)) => {
            result.context("daemon stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    Ok(())
}

async fn handle_reset(parts: &Components, stoptime: &str) -> Result<()> {
    let load_type = parts.config.extract_type;
    let stoptime = StopTime::parse_key(load_type, stoptime).map_err(|e| anyhow!(e))?;
    let entry = reset_failed(parts.store.as_ref(), &parts.vault, load_type, stoptime).await?;
    println!("reset {} to {}", entry.sort_key(), entry.status);
    Ok(())
}

async fn handle_trigger_full(parts: &Components, snapshot_date: NaiveDate) -> Result<()> {
    let report = trigger_full(
        parts.store.as_ref(),
        parts.staging.as_ref(),
        &parts.vault,
        snapshot_date,
    )
    .await?;
    println!(
        "full load triggered: epoch {}, {} entries rewound, full entry registered: {}",
        report.new_epoch, report.rewound, report.full_registered
    );
    Ok(())
}

async fn handle_show_state(parts: &Components) -> Result<()> {
    let state = parts.store.get_vault_state(&parts.vault).await?;
    let mut queue = Vec::new();
    for load_type in [LoadType::Incr, LoadType::Log, LoadType::Full] {
        queue.extend(
            parts
                .store
                .scan_forward(&parts.vault, load_type, None, 1000)
                .await?,
        );
    }
    let output = serde_json::json!({
        "vault_id": parts.vault.as_str(),
        "vault_state": state,
        "queue": queue,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
