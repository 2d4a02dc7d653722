//! Staged object layout.
//!
//! ```text
//! <root>/vault=<vault_id>/
//!   incr/stoptime=<YYYYMMDDHHMM>/manifest.csv
//!                               /<object>_upsert.csv
//!                               /<object>_delete.csv
//!   log/date=<YYYYMMDD>/log_manifest.csv
//!                      /log_data.csv
//!   full/date=<YYYYMMDD>/full_manifest.csv
//!                       /*.csv
//! ```

use lode_types::{LoadType, StopTime, VaultId};

/// Key builder for one window's staging prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPrefix {
    vault: VaultId,
    load_type: LoadType,
    logical_time: StopTime,
}

impl WindowPrefix {
    /// Prefix for `(vault, load_type, logical_time)`.
    pub fn new(vault: VaultId, load_type: LoadType, logical_time: StopTime) -> Self {
        Self {
            vault,
            load_type,
            logical_time,
        }
    }

    /// The window's prefix, without a trailing slash.
    pub fn prefix(&self) -> String {
        let time_key = self.logical_time.key_for(self.load_type);
        match self.load_type {
            LoadType::Incr => format!("vault={}/incr/stoptime={time_key}", self.vault),
            LoadType::Log => format!("vault={}/log/date={time_key}", self.vault),
            LoadType::Full => format!("vault={}/full/date={time_key}", self.vault),
        }
    }

    /// Name of the manifest file for this load type.
    pub fn manifest_name(&self) -> &'static str {
        match self.load_type {
            LoadType::Incr => "manifest.csv",
            LoadType::Log => "log_manifest.csv",
            LoadType::Full => "full_manifest.csv",
        }
    }

    /// Key of the manifest; written last, so its presence marks the whole
    /// prefix complete.
    pub fn manifest_key(&self) -> String {
        format!("{}/{}", self.prefix(), self.manifest_name())
    }

    /// Key of the normalized window metadata.
    pub fn metadata_key(&self) -> String {
        format!("{}/metadata.csv", self.prefix())
    }

    /// Key of a data file inside the window.
    pub fn data_key(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.prefix())
    }
}
