#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lode-types** – Shared primitive data structures for the Lode control plane.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, storage drivers, or the
//! warehouse; those live behind traits in the `lode-store-core`,
//! `lode-staging` and `lode-warehouse-core` crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Process configuration read once at startup.
pub mod config;
pub use config::{LodeConfig, StoreBackend};

//─────────────────────────────
//  Validation constants
//─────────────────────────────

/// Maximum allowed length of a vault identifier.
pub const MAX_VAULT_ID_LEN: usize = 128;

/// Maximum allowed length of an error message persisted on a queue entry.
pub const MAX_LAST_ERROR_LEN: usize = 4096;

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Opaque tenant identifier.
///
/// Every queue entry, vault state row, lease, and staging prefix is scoped
/// by a vault. Vault identifiers sort lexically, which keeps composite
/// store keys order-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultId(String);

impl VaultId {
    /// Create a new vault identifier with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("vault id cannot be empty".to_string());
        }
        if id.len() > MAX_VAULT_ID_LEN {
            return Err(format!(
                "vault id too long: {} > {}",
                id.len(),
                MAX_VAULT_ID_LEN
            ));
        }
        if id.contains(['#', '\0', '/']) {
            return Err("vault id must not contain '#', '/' or NUL".to_string());
        }
        Ok(Self(id))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generation counter incremented on every full-load trigger.
///
/// Queue entries carry the epoch they were registered (or rewound) under;
/// entries whose epoch differs from the vault's `current_epoch` are
/// invisible to the consumer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The successor epoch.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//─────────────────────────────
//  Load types and logical time
//─────────────────────────────

/// The three change-set families produced by the vendor feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    /// Minute-granular incremental change set.
    Incr,
    /// Daily audit-log extract; independent watermark.
    Log,
    /// Full snapshot; supersedes INCR and LOG.
    Full,
}

impl LoadType {
    /// Lowercase token used in sort keys and staging prefixes.
    pub fn token(self) -> &'static str {
        match self {
            LoadType::Incr => "incr",
            LoadType::Log => "log",
            LoadType::Full => "full",
        }
    }

    /// Sort-key prefix for this load type, including the separator.
    pub fn sort_prefix(self) -> String {
        format!("{}#", self.token())
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for LoadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incr" => Ok(LoadType::Incr),
            "log" => Ok(LoadType::Log),
            "full" => Ok(LoadType::Full),
            other => Err(format!("unknown load type: {other}")),
        }
    }
}

/// Vendor-assigned stop-time of one window, truncated to minute precision.
///
/// INCR windows key on the full minute (`YYYYMMDDHHMM`); LOG and FULL
/// windows key on the date (`YYYYMMDD`, midnight UTC). The key formats are
/// chosen so that lexical order equals chronological order, which is what
/// lets the store's range scans double as the apply-order selection rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StopTime(DateTime<Utc>);

impl StopTime {
    /// Build from an arbitrary instant, truncating to the minute.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let truncated = dt
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .unwrap_or(dt);
        Self(truncated)
    }

    /// Midnight UTC of the given date; the stop-time form used by LOG and
    /// FULL windows.
    pub fn from_date(date: NaiveDate) -> Self {
        Self(NaiveDateTime::new(date, NaiveTime::MIN).and_utc())
    }

    /// The underlying instant.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Minute-precision key: `YYYYMMDDHHMM`.
    pub fn minute_key(&self) -> String {
        self.0.format("%Y%m%d%H%M").to_string()
    }

    /// Date-precision key: `YYYYMMDD`.
    pub fn date_key(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    /// The logical-time key appropriate for `load_type`.
    pub fn key_for(&self, load_type: LoadType) -> String {
        match load_type {
            LoadType::Incr => self.minute_key(),
            LoadType::Log | LoadType::Full => self.date_key(),
        }
    }

    /// Parse a logical-time key back into a stop-time.
    pub fn parse_key(load_type: LoadType, key: &str) -> Result<Self, String> {
        match load_type {
            LoadType::Incr => NaiveDateTime::parse_from_str(key, "%Y%m%d%H%M")
                .map(|naive| Self(naive.and_utc()))
                .map_err(|e| format!("invalid minute key {key:?}: {e}")),
            LoadType::Log | LoadType::Full => NaiveDate::parse_from_str(key, "%Y%m%d")
                .map(Self::from_date)
                .map_err(|e| format!("invalid date key {key:?}: {e}")),
        }
    }
}

impl fmt::Display for StopTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%MZ"))
    }
}

//─────────────────────────────
//  Queue entries
//─────────────────────────────

/// Lifecycle status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryStatus {
    /// Staged and eligible for selection.
    Ready,
    /// Claimed by a consumer; at most one per vault at any instant.
    Processing,
    /// Committed to the warehouse.
    Applied,
    /// Apply failed; requires operator reset.
    Failed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Ready => "READY",
            EntryStatus::Processing => "PROCESSING",
            EntryStatus::Applied => "APPLIED",
            EntryStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Typed key of a queue entry: `(vault_id, sort_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    /// Owning vault.
    pub vault_id: VaultId,
    /// Window family.
    pub load_type: LoadType,
    /// Window stop-time.
    pub logical_time: StopTime,
}

impl EntryKey {
    /// The lexically-ordered sort key `<load_type>#<logical_time_key>`.
    pub fn sort_key(&self) -> String {
        format!(
            "{}#{}",
            self.load_type.token(),
            self.logical_time.key_for(self.load_type)
        )
    }
}

/// One registered window in the control-plane queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Owning vault.
    pub vault_id: VaultId,
    /// Window family.
    pub load_type: LoadType,
    /// Window stop-time; the ordering key within a load type.
    pub logical_time: StopTime,
    /// Lifecycle status.
    pub status: EntryStatus,
    /// Staging prefix holding the manifest and data files.
    pub staging_prefix: String,
    /// Hex-encoded manifest digest; the idempotent re-registration key.
    pub checksum: String,
    /// Epoch the entry was registered (or rewound) under.
    pub epoch: Epoch,
    /// Number of times a consumer has claimed this entry.
    pub attempt_count: u32,
    /// Error message from the most recent failed apply.
    pub last_error: Option<String>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status-transition timestamp.
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Build a freshly-registered READY entry.
    pub fn ready(
        vault_id: VaultId,
        load_type: LoadType,
        logical_time: StopTime,
        staging_prefix: String,
        checksum: String,
        epoch: Epoch,
    ) -> Self {
        let now = Utc::now();
        Self {
            vault_id,
            load_type,
            logical_time,
            status: EntryStatus::Ready,
            staging_prefix,
            checksum,
            epoch,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The typed key of this entry.
    pub fn key(&self) -> EntryKey {
        EntryKey {
            vault_id: self.vault_id.clone(),
            load_type: self.load_type,
            logical_time: self.logical_time,
        }
    }

    /// The lexically-ordered sort key.
    pub fn sort_key(&self) -> String {
        self.key().sort_key()
    }
}

//─────────────────────────────
//  Vault state
//─────────────────────────────

/// Operating mode of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VaultMode {
    /// Normal operation: INCR windows applied in stop-time order.
    Incremental,
    /// A full snapshot is pending; only FULL windows are eligible.
    FullLoad,
}

/// Durable per-vault control state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultState {
    /// Operating mode.
    pub mode: VaultMode,
    /// Greatest stop-time whose INCR or FULL window has COMMITted.
    /// Advances only on commit; never moves backwards within an epoch.
    pub last_applied_stoptime: Option<StopTime>,
    /// Independent watermark for the LOG consumer.
    pub log_watermark: Option<StopTime>,
    /// Current generation; bumped by the full-load trigger.
    pub current_epoch: Epoch,
    /// When the most recent full load was triggered (audit).
    pub full_load_started_at: Option<DateTime<Utc>>,
}

impl Default for VaultState {
    fn default() -> Self {
        Self {
            mode: VaultMode::Incremental,
            last_applied_stoptime: None,
            log_watermark: None,
            current_epoch: Epoch::default(),
            full_load_started_at: None,
        }
    }
}

/// A time-bounded exclusive claim on a lease key held by one consumer.
///
/// Lease keys are `<vault_id>` for the INCR/FULL consumer and
/// `<vault_id>#log` for the independent LOG consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Opaque owner token (one per consumer process invocation).
    pub owner: String,
    /// Instant after which the lease may be taken over.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Lease key for a vault's INCR/FULL consumer.
pub fn incr_lease_key(vault: &VaultId) -> String {
    vault.as_str().to_string()
}

/// Lease key for a vault's independent LOG consumer.
pub fn log_lease_key(vault: &VaultId) -> String {
    format!("{}#log", vault.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn minute(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> StopTime {
        let date = NaiveDate::from_ymd_opt(y, mo, d).unwrap();
        let time = NaiveTime::from_hms_opt(h, mi, 0).unwrap();
        StopTime::from_datetime(NaiveDateTime::new(date, time).and_utc())
    }

    #[test]
    fn vault_id_validation() {
        assert!(VaultId::new("acme-prod").is_ok());
        assert!(VaultId::new("").is_err());
        assert!(VaultId::new("a#b").is_err());
        assert!(VaultId::new("a/b").is_err());
        assert!(VaultId::new("x".repeat(MAX_VAULT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn stoptime_truncates_to_minute() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let time = NaiveTime::from_hms_opt(0, 15, 42).unwrap();
        let st = StopTime::from_datetime(NaiveDateTime::new(date, time).and_utc());
        assert_eq!(st.minute_key(), "202401010015");
    }

    #[test]
    fn sort_key_formats() {
        let st = minute(2024, 1, 1, 0, 15);
        let key = EntryKey {
            vault_id: VaultId::new("v1").unwrap(),
            load_type: LoadType::Incr,
            logical_time: st,
        };
        assert_eq!(key.sort_key(), "incr#202401010015");

        let full = EntryKey {
            vault_id: VaultId::new("v1").unwrap(),
            load_type: LoadType::Full,
            logical_time: StopTime::from_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
        };
        assert_eq!(full.sort_key(), "full#20240101");
    }

    #[test]
    fn key_roundtrip() {
        let st = minute(2024, 3, 7, 23, 45);
        let parsed = StopTime::parse_key(LoadType::Incr, &st.minute_key()).unwrap();
        assert_eq!(parsed, st);

        let d = StopTime::from_date(NaiveDate::from_ymd_opt(2024, 3, 7).unwrap());
        let parsed = StopTime::parse_key(LoadType::Full, &d.date_key()).unwrap();
        assert_eq!(parsed, d);

        assert!(StopTime::parse_key(LoadType::Incr, "not-a-key").is_err());
    }

    #[test]
    fn load_type_parsing() {
        assert_eq!("INCR".parse::<LoadType>().unwrap(), LoadType::Incr);
        assert_eq!("log".parse::<LoadType>().unwrap(), LoadType::Log);
        assert_eq!("Full".parse::<LoadType>().unwrap(), LoadType::Full);
        assert!("delta".parse::<LoadType>().is_err());
    }

    #[test]
    fn queue_entry_serde_roundtrip() {
        let entry = QueueEntry::ready(
            VaultId::new("v1").unwrap(),
            LoadType::Incr,
            minute(2024, 1, 1, 0, 15),
            "vault=v1/incr/stoptime=202401010015".to_string(),
            "abc123".to_string(),
            Epoch(2),
        );
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.status, EntryStatus::Ready);
    }

    proptest! {
        // Lexical order of minute keys must equal chronological order;
        // the store's range scans rely on this.
        #[test]
        fn minute_key_order_matches_time_order(
            a in 0i64..=20_000_000, b in 0i64..=20_000_000
        ) {
            let base = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
                .and_time(NaiveTime::MIN).and_utc();
            let ta = StopTime::from_datetime(base + chrono::Duration::minutes(a));
            let tb = StopTime::from_datetime(base + chrono::Duration::minutes(b));
            prop_assert_eq!(
                ta.minute_key().cmp(&tb.minute_key()),
                ta.cmp(&tb)
            );
        }
    }
}
