//! Producer-tick tests against an in-memory feed and control-plane store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;

use lode_producer::{
    PartStream, Producer, ProducerConfig, ProducerError, VendorFeed, WindowDescriptor,
};
use lode_staging::{manifest_checksum, LocalFsStaging, StagingStore, WindowPrefix};
use lode_store_core::{Alert, ControlPlaneStore, Severity, StoreError};
use lode_store_memory::MemoryStore;
use lode_types::{
    EntryStatus, Epoch, LoadType, QueueEntry, StopTime, VaultId, VaultState,
};

//─────────────────────────────
//  Test doubles
//─────────────────────────────

struct MemoryFeed {
    windows: Vec<WindowDescriptor>,
    archives: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl VendorFeed for MemoryFeed {
    async fn list_windows(
        &self,
        load_type: LoadType,
        from: Option<StopTime>,
    ) -> anyhow::Result<Vec<WindowDescriptor>> {
        Ok(self
            .windows
            .iter()
            .filter(|w| w.load_type == load_type)
            .filter(|w| from.map_or(true, |f| w.logical_time > f))
            .cloned()
            .collect())
    }

    async fn fetch_part(
        &self,
        _window: &WindowDescriptor,
        part: &str,
    ) -> anyhow::Result<Box<dyn PartStream>> {
        let bytes = self
            .archives
            .get(part)
            .ok_or_else(|| anyhow::anyhow!("no archive for part {part}"))?
            .clone();
        Ok(Box::new(ChunkStream { bytes, pos: 0 }))
    }
}

struct ChunkStream {
    bytes: Vec<u8>,
    pos: usize,
}

#[async_trait]
impl PartStream for ChunkStream {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        // Tiny chunks exercise the multipart path.
        const CHUNK: usize = 7;
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }
        let end = (self.pos + CHUNK).min(self.bytes.len());
        let chunk = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(Some(chunk))
    }
}

#[derive(Default)]
struct RecordingAlert {
    fired: Mutex<Vec<String>>,
}

#[async_trait]
impl Alert for RecordingAlert {
    async fn fire(&self, _severity: Severity, summary: &str, detail: &str) {
        self.fired
            .lock()
            .unwrap()
            .push(format!("{summary}: {detail}"));
    }
}

//─────────────────────────────
//  Fixtures
//─────────────────────────────

fn vault() -> VaultId {
    VaultId::new("acme").unwrap()
}

fn minute(h: u32, m: u32) -> StopTime {
    let dt = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
        .and_utc();
    StopTime::from_datetime(dt)
}

fn build_tar(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in entries {
        let bytes = contents.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, bytes).unwrap();
    }
    builder.into_inner().unwrap()
}

const METADATA: &str = "object_name,column_name,vendor_type,nullable,is_primary,max_length\n\
account,id,ID,false,true,\n\
account,score,Number,true,false,\n";

const VENDOR_MANIFEST: &str = "object_name,operation,file_path,schema_fingerprint,row_count,column_name,from_type,to_type\n\
account,upsert,account_upsert.csv,fp-1,2,,,\n";

fn good_archive() -> Vec<u8> {
    build_tar(&[
        ("metadata.csv", METADATA),
        ("account_upsert.csv", "id,score\na1,10\na2,20\n"),
        ("manifest.csv", VENDOR_MANIFEST),
    ])
}

struct Harness {
    _dir: tempfile::TempDir,
    staging: Arc<LocalFsStaging>,
    store: Arc<MemoryStore>,
    alert: Arc<RecordingAlert>,
    producer: Producer,
}

fn harness(windows: Vec<(StopTime, u64, Vec<u8>)>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let staging = Arc::new(LocalFsStaging::new(dir.path()).unwrap());
    let store = Arc::new(MemoryStore::new());
    let alert = Arc::new(RecordingAlert::default());

    let mut descriptors = Vec::new();
    let mut archives = HashMap::new();
    for (stop, row_count, archive) in windows {
        let part = stop.minute_key();
        descriptors.push(WindowDescriptor {
            load_type: LoadType::Incr,
            logical_time: stop,
            row_count,
            parts: vec![part.clone()],
        });
        archives.insert(part, archive);
    }
    let feed = Arc::new(MemoryFeed {
        windows: descriptors,
        archives,
    });

    let producer = Producer::new(
        feed,
        staging.clone(),
        store.clone(),
        alert.clone(),
        ProducerConfig {
            vault: vault(),
            extract_type: LoadType::Incr,
            use_dynamic_window: false,
            dynamic_lookback_hours: 24,
            convert_to_columnar: false,
        },
    );
    Harness {
        _dir: dir,
        staging,
        store,
        alert,
        producer,
    }
}

//─────────────────────────────
//  Tests
//─────────────────────────────

#[tokio::test]
async fn happy_path_stages_and_registers_ready_entry() {
    let hx = harness(vec![(minute(0, 15), 2, good_archive())]);

    let report = hx.producer.tick().await.unwrap();
    assert_eq!(report.listed, 1);
    assert_eq!(report.registered, 1);
    assert_eq!(report.skipped, 0);

    let window = WindowPrefix::new(vault(), LoadType::Incr, minute(0, 15));
    let entry = hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Ready);
    assert_eq!(entry.epoch, Epoch(0));
    assert_eq!(entry.attempt_count, 0);
    assert_eq!(entry.staging_prefix, window.prefix());

    let manifest = hx.staging.get(&window.manifest_key()).await.unwrap().unwrap();
    assert_eq!(entry.checksum, manifest_checksum(&manifest));
    assert!(hx.staging.exists(&window.metadata_key()).await.unwrap());
    assert!(hx
        .staging
        .exists(&window.data_key("account_upsert.csv"))
        .await
        .unwrap());
}

#[tokio::test]
async fn retried_tick_is_a_no_op() {
    let hx = harness(vec![(minute(0, 15), 2, good_archive())]);

    hx.producer.tick().await.unwrap();
    let first = hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .unwrap();

    let report = hx.producer.tick().await.unwrap();
    assert_eq!(report.registered, 0);
    assert_eq!(report.already_registered, 1);

    let second = hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn zero_row_windows_are_dropped() {
    let hx = harness(vec![(minute(0, 15), 0, good_archive())]);

    let report = hx.producer.tick().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.registered, 0);
    assert!(hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn windows_behind_watermark_are_dropped() {
    let hx = harness(vec![
        (minute(0, 15), 2, good_archive()),
        (minute(0, 45), 2, good_archive()),
    ]);
    hx.store
        .init_vault_state(
            &vault(),
            VaultState {
                last_applied_stoptime: Some(minute(0, 30)),
                ..VaultState::default()
            },
        )
        .await
        .unwrap();

    let report = hx.producer.tick().await.unwrap();
    // The feed itself filters on `from`, so 00:15 is never listed; 00:45
    // is staged and registered.
    assert_eq!(report.registered, 1);
    assert!(hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .is_none());
    assert!(hx
        .store
        .get_entry(&vault(), "incr#202401010045")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn checksum_conflict_is_alerted_and_fatal() {
    let hx = harness(vec![(minute(0, 15), 2, good_archive())]);

    // Someone already registered this window with a different checksum.
    let window = WindowPrefix::new(vault(), LoadType::Incr, minute(0, 15));
    hx.store
        .put_if_absent(QueueEntry::ready(
            vault(),
            LoadType::Incr,
            minute(0, 15),
            window.prefix(),
            "someone-elses-checksum".to_string(),
            Epoch(0),
        ))
        .await
        .unwrap();

    let err = hx.producer.tick().await.unwrap_err();
    assert!(matches!(
        err,
        ProducerError::Store(StoreError::ChecksumMismatch { .. })
    ));
    assert_eq!(hx.alert.fired.lock().unwrap().len(), 1);

    // The stored entry is untouched.
    let entry = hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.checksum, "someone-elses-checksum");
}

#[tokio::test]
async fn failed_window_defers_the_tail_to_the_next_tick() {
    let hx = harness(vec![
        (minute(0, 15), 2, b"this is not a tar archive at all".to_vec()),
        (minute(0, 30), 2, good_archive()),
    ]);

    let report = hx.producer.tick().await.unwrap();
    assert_eq!(report.registered, 0);
    // Neither the broken window nor its successor registered; applying
    // 00:30 first would advance the watermark past 00:15 forever.
    assert!(hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .is_none());
    assert!(hx
        .store
        .get_entry(&vault(), "incr#202401010030")
        .await
        .unwrap()
        .is_none());
}
