//! Process configuration.
//!
//! Configuration is read once per process at startup and treated as
//! immutable input from then on. The CLI populates this from env-backed
//! flags; tests construct it directly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::LoadType;

/// Which control-plane store driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Non-persistent in-memory store; tests and local development.
    Memory,
    /// Durable embedded sled store.
    Sled,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "sled" => Ok(StoreBackend::Sled),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Immutable per-process configuration.
#[derive(Debug, Clone)]
pub struct LodeConfig {
    /// Tenant this process serves.
    pub vault_id: String,
    /// Name of the vault-state table (sled tree name).
    pub state_table_name: String,
    /// Name of the queue table (sled tree name).
    pub queue_table_name: String,
    /// Root of the object staging layer.
    pub object_store_root: PathBuf,
    /// Warehouse connection string. `memory:` selects the in-memory driver.
    pub warehouse_dsn: String,
    /// Which window family this process extracts/consumes.
    pub extract_type: LoadType,
    /// On first run, look back `dynamic_lookback_hours` instead of a fixed start.
    pub use_dynamic_window: bool,
    /// Lookback horizon for the dynamic first-run window.
    pub dynamic_lookback_hours: u32,
    /// Re-encode staged CSVs with typed normalization in 100k-row chunks.
    pub convert_to_columnar: bool,
    /// Claim attempts before a crashed PROCESSING entry needs operator reset.
    pub max_attempts: u32,
    /// Control-plane store driver.
    pub store_backend: StoreBackend,
    /// Path of the sled store (ignored by the memory driver).
    pub store_path: PathBuf,
    /// Consumer lease TTL.
    pub lease_ttl: Duration,
}

impl Default for LodeConfig {
    fn default() -> Self {
        Self {
            vault_id: String::new(),
            state_table_name: "vault_state".to_string(),
            queue_table_name: "queue".to_string(),
            object_store_root: PathBuf::from("lode-staging"),
            warehouse_dsn: "memory:".to_string(),
            extract_type: LoadType::Incr,
            use_dynamic_window: false,
            dynamic_lookback_hours: 24,
            convert_to_columnar: false,
            max_attempts: 3,
            store_backend: StoreBackend::Sled,
            store_path: PathBuf::from("lode-store"),
            lease_ttl: Duration::from_secs(900),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parsing() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("SLED".parse::<StoreBackend>().unwrap(), StoreBackend::Sled);
        assert!("dynamo".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = LodeConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.extract_type, LoadType::Incr);
        assert_eq!(cfg.store_backend, StoreBackend::Sled);
    }
}
