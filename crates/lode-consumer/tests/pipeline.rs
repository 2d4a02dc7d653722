//! End-to-end pipeline scenarios: memory store, memory warehouse, tempdir
//! staging, real consumer driver loop.

use std::sync::Arc;

use chrono::NaiveDate;

use lode_apply::ApplyEngine;
use lode_consumer::{reset_failed, trigger_full, Consumer, ConsumerConfig, Outcome};
use lode_staging::{
    manifest_checksum, write_manifest, write_metadata, LocalFsStaging, ManifestRow,
    ObjectColumn, StagingStore, WindowPrefix,
};
use lode_store_core::{ChangeEvent, ControlPlaneStore, TracingAlert};
use lode_store_memory::MemoryStore;
use lode_types::{
    EntryStatus, Epoch, LoadType, QueueEntry, StopTime, VaultId, VaultMode, VaultState,
};
use lode_warehouse_memory::MemoryWarehouse;

//─────────────────────────────
//  Harness
//─────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    staging: Arc<LocalFsStaging>,
    warehouse: Arc<MemoryWarehouse>,
    consumer: Consumer,
}

fn vault() -> VaultId {
    VaultId::new("acme").unwrap()
}

fn minute(day: u32, h: u32, m: u32) -> StopTime {
    let dt = NaiveDate::from_ymd_opt(2024, 1, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
        .and_utc();
    StopTime::from_datetime(dt)
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let staging = Arc::new(LocalFsStaging::new(dir.path()).unwrap());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let engine = ApplyEngine::new(staging.clone(), warehouse.clone());
    let consumer = Consumer::new(
        store.clone(),
        engine,
        Arc::new(TracingAlert),
        ConsumerConfig {
            vault: vault(),
            load_class: LoadType::Incr,
            lease_ttl: std::time::Duration::from_secs(60),
            max_attempts: 3,
            scan_limit: 64,
        },
    );
    Harness {
        _dir: dir,
        store,
        staging,
        warehouse,
        consumer,
    }
}

fn account_metadata() -> Vec<ObjectColumn> {
    vec![
        ObjectColumn {
            object_name: "account".to_string(),
            column_name: "id".to_string(),
            vendor_type: "ID".to_string(),
            nullable: false,
            is_primary: true,
            max_length: None,
        },
        ObjectColumn {
            object_name: "account".to_string(),
            column_name: "score".to_string(),
            vendor_type: "Number".to_string(),
            nullable: true,
            is_primary: false,
            max_length: None,
        },
    ]
}

/// Stage one window (data, metadata, manifest last) and register it READY.
async fn stage_and_register(
    hx: &Harness,
    load_type: LoadType,
    stop: StopTime,
    epoch: Epoch,
    upsert_csv: &str,
) -> QueueEntry {
    let window = WindowPrefix::new(vault(), load_type, stop);
    let file_name = match load_type {
        LoadType::Full => "account.csv",
        _ => "account_upsert.csv",
    };
    hx.staging
        .put(&window.data_key(file_name), upsert_csv.as_bytes())
        .await
        .unwrap();
    hx.staging
        .put(
            &window.metadata_key(),
            &write_metadata(&account_metadata()).unwrap(),
        )
        .await
        .unwrap();
    let rows = vec![ManifestRow::Upsert {
        object: "account".to_string(),
        file_path: file_name.to_string(),
        schema_fingerprint: "fp".to_string(),
        row_count: upsert_csv.lines().count() as u64 - 1,
    }];
    let manifest = write_manifest(&rows).unwrap();
    hx.staging
        .put(&window.manifest_key(), &manifest)
        .await
        .unwrap();

    let entry = QueueEntry::ready(
        vault(),
        load_type,
        stop,
        window.prefix(),
        manifest_checksum(&manifest),
        epoch,
    );
    hx.store.put_if_absent(entry.clone()).await.unwrap();
    entry
}

async fn entry_status(hx: &Harness, sort_key: &str) -> EntryStatus {
    hx.store
        .get_entry(&vault(), sort_key)
        .await
        .unwrap()
        .unwrap()
        .status
}

async fn watermark(hx: &Harness) -> Option<StopTime> {
    hx.store
        .get_vault_state(&vault())
        .await
        .unwrap()
        .unwrap()
        .last_applied_stoptime
}

//─────────────────────────────
//  Scenario 1: happy path
//─────────────────────────────

#[tokio::test]
async fn happy_path_applies_one_window_and_advances_watermark() {
    let hx = harness();
    hx.store
        .init_vault_state(
            &vault(),
            VaultState {
                last_applied_stoptime: Some(minute(1, 0, 0)),
                ..VaultState::default()
            },
        )
        .await
        .unwrap();
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 15),
        Epoch(0),
        "id,score\na1,10\na2,20\n",
    )
    .await;

    let outcome = hx.consumer.run_once().await.unwrap();
    assert_eq!(outcome, Outcome::Drained { applied: 1 });

    assert_eq!(
        entry_status(&hx, "incr#202401010015").await,
        EntryStatus::Applied
    );
    assert_eq!(watermark(&hx).await, Some(minute(1, 0, 15)));
    assert_eq!(hx.warehouse.row_count("account").await, Some(2));

    let entry = hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.attempt_count, 1);
}

//─────────────────────────────
//  Scenario 2: blocked by failure, then reset and resume
//─────────────────────────────

#[tokio::test]
async fn failure_pauses_the_queue_until_operator_reset() {
    let hx = harness();
    hx.store
        .init_vault_state(&vault(), VaultState::default())
        .await
        .unwrap();
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 15),
        Epoch(0),
        "id,score\na1,10\n",
    )
    .await;
    // 00:30 carries a value the warehouse rejects for a Number column.
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 30),
        Epoch(0),
        "id,score\na2,boom\n",
    )
    .await;
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 45),
        Epoch(0),
        "id,score\na3,30\n",
    )
    .await;

    let outcome = hx.consumer.run_once().await.unwrap();
    let Outcome::Failed { sort_key, .. } = outcome else {
        panic!("expected Failed outcome, got {outcome:?}");
    };
    assert_eq!(sort_key, "incr#202401010030");

    assert_eq!(
        entry_status(&hx, "incr#202401010015").await,
        EntryStatus::Applied
    );
    assert_eq!(
        entry_status(&hx, "incr#202401010030").await,
        EntryStatus::Failed
    );
    assert_eq!(
        entry_status(&hx, "incr#202401010045").await,
        EntryStatus::Ready
    );
    assert_eq!(watermark(&hx).await, Some(minute(1, 0, 15)));

    // Re-running while blocked applies nothing.
    let outcome = hx.consumer.run_once().await.unwrap();
    assert!(matches!(outcome, Outcome::Blocked { .. }));

    // Operator repairs the staged data and resets the entry; the reset
    // lands on the change stream, which is what wakes the daemon.
    let window = WindowPrefix::new(vault(), LoadType::Incr, minute(1, 0, 30));
    hx.staging
        .put(&window.data_key("account_upsert.csv"), b"id,score\na2,20\n")
        .await
        .unwrap();
    let mut events = hx.store.subscribe();
    reset_failed(
        hx.store.as_ref(),
        &vault(),
        LoadType::Incr,
        minute(1, 0, 30),
    )
    .await
    .unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        ChangeEvent::EntryUpdated {
            status: EntryStatus::Ready,
            ..
        }
    ));

    let outcome = hx.consumer.run_once().await.unwrap();
    assert_eq!(outcome, Outcome::Drained { applied: 2 });
    assert_eq!(watermark(&hx).await, Some(minute(1, 0, 45)));
    assert_eq!(hx.warehouse.row_count("account").await, Some(3));
}

//─────────────────────────────
//  Scenario 3: racing consumers
//─────────────────────────────

#[tokio::test]
async fn racing_consumers_apply_each_window_exactly_once() {
    let hx = harness();
    hx.store
        .init_vault_state(&vault(), VaultState::default())
        .await
        .unwrap();
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 15),
        Epoch(0),
        "id,score\na1,10\n",
    )
    .await;

    let second = Consumer::new(
        hx.store.clone(),
        ApplyEngine::new(hx.staging.clone(), hx.warehouse.clone()),
        Arc::new(TracingAlert),
        ConsumerConfig {
            vault: vault(),
            load_class: LoadType::Incr,
            lease_ttl: std::time::Duration::from_secs(60),
            max_attempts: 3,
            scan_limit: 64,
        },
    );

    let (a, b) = tokio::join!(hx.consumer.run_once(), second.run_once());
    let outcomes = [a.unwrap(), b.unwrap()];

    // Whoever lost the lease exits cleanly; the window applied once.
    let applied_total: usize = outcomes
        .iter()
        .map(|o| match o {
            Outcome::Drained { applied } => *applied,
            _ => 0,
        })
        .sum();
    assert_eq!(applied_total, 1);

    let entry = hx
        .store
        .get_entry(&vault(), "incr#202401010015")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Applied);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(hx.warehouse.row_count("account").await, Some(1));
}

//─────────────────────────────
//  Scenario 5: full rewind
//─────────────────────────────

#[tokio::test]
async fn full_trigger_rewinds_and_reapplies_incr_windows() {
    let hx = harness();
    hx.store
        .init_vault_state(&vault(), VaultState::default())
        .await
        .unwrap();

    // Four INCR windows applied for real: 23:45 of day 1, then 00:15,
    // 00:30, 00:45 of day 2.
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 23, 45),
        Epoch(0),
        "id,score\na1,1\n",
    )
    .await;
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(2, 0, 15),
        Epoch(0),
        "id,score\na2,2\n",
    )
    .await;
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(2, 0, 30),
        Epoch(0),
        "id,score\na3,3\n",
    )
    .await;
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(2, 0, 45),
        Epoch(0),
        "id,score\na4,4\n",
    )
    .await;
    assert_eq!(
        hx.consumer.run_once().await.unwrap(),
        Outcome::Drained { applied: 4 }
    );
    assert_eq!(watermark(&hx).await, Some(minute(2, 0, 45)));

    // Stage the snapshot, then trigger the rewind for day 2.
    let boundary_date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
    let boundary = StopTime::from_date(boundary_date);
    stage_and_register(
        &hx,
        LoadType::Full,
        boundary,
        Epoch(0),
        "id,score\ns1,100\n",
    )
    .await;

    let report = trigger_full(
        hx.store.as_ref(),
        hx.staging.as_ref(),
        &vault(),
        boundary_date,
    )
    .await
    .unwrap();
    assert_eq!(report.new_epoch, Epoch(1));
    assert_eq!(report.rewound, 3);
    assert!(report.full_registered);

    let state = hx.store.get_vault_state(&vault()).await.unwrap().unwrap();
    assert_eq!(state.mode, VaultMode::FullLoad);
    assert_eq!(state.current_epoch, Epoch(1));
    assert_eq!(state.last_applied_stoptime, Some(boundary));

    // Day-2 entries are READY under the new epoch; 23:45 is untouched.
    for sort_key in ["incr#202401020015", "incr#202401020030", "incr#202401020045"] {
        let entry = hx.store.get_entry(&vault(), sort_key).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Ready);
        assert_eq!(entry.epoch, Epoch(1));
    }
    let untouched = hx
        .store
        .get_entry(&vault(), "incr#202401012345")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, EntryStatus::Applied);
    assert_eq!(untouched.epoch, Epoch(0));

    let full_entry = hx
        .store
        .get_entry(&vault(), "full#20240102")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(full_entry.status, EntryStatus::Ready);
    assert_eq!(full_entry.epoch, Epoch(1));

    // Replaying the trigger is a no-op (idempotent batch).
    let replay = trigger_full(
        hx.store.as_ref(),
        hx.staging.as_ref(),
        &vault(),
        boundary_date,
    )
    .await
    .unwrap();
    assert_eq!(replay.new_epoch, Epoch(1));
    assert_eq!(replay.rewound, 0);

    // One consumer pass applies the FULL snapshot, flips the vault back to
    // INCREMENTAL, and re-applies the rewound windows in order.
    let outcome = hx.consumer.run_once().await.unwrap();
    assert_eq!(outcome, Outcome::Drained { applied: 4 });

    let state = hx.store.get_vault_state(&vault()).await.unwrap().unwrap();
    assert_eq!(state.mode, VaultMode::Incremental);
    assert_eq!(state.last_applied_stoptime, Some(minute(2, 0, 45)));

    // The snapshot replaced the table; rewound windows re-upserted rows.
    let table = hx.warehouse.table("account").await.unwrap();
    let mut ids: Vec<String> = table
        .rows
        .iter()
        .map(|r| r[0].clone().unwrap_or_default())
        .collect();
    ids.sort();
    assert_eq!(ids, ["a2", "a3", "a4", "s1"]);
}

#[tokio::test]
async fn full_trigger_rewinds_ready_and_failed_entries_too() {
    let hx = harness();
    hx.store
        .init_vault_state(&vault(), VaultState::default())
        .await
        .unwrap();

    // Leave the queue in a mixed state past the boundary: 00:15 APPLIED,
    // 00:30 FAILED (bad Number value), 00:45 still READY behind it.
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 15),
        Epoch(0),
        "id,score\na1,1\n",
    )
    .await;
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 30),
        Epoch(0),
        "id,score\na2,boom\n",
    )
    .await;
    stage_and_register(
        &hx,
        LoadType::Incr,
        minute(1, 0, 45),
        Epoch(0),
        "id,score\na3,3\n",
    )
    .await;
    let outcome = hx.consumer.run_once().await.unwrap();
    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert_eq!(
        entry_status(&hx, "incr#202401010015").await,
        EntryStatus::Applied
    );
    assert_eq!(
        entry_status(&hx, "incr#202401010030").await,
        EntryStatus::Failed
    );
    assert_eq!(
        entry_status(&hx, "incr#202401010045").await,
        EntryStatus::Ready
    );

    // No snapshot is staged yet; the trigger still rewinds every entry
    // past the boundary, FAILED and READY included, so none of them is
    // stranded invisible at the old epoch.
    let boundary_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let report = trigger_full(
        hx.store.as_ref(),
        hx.staging.as_ref(),
        &vault(),
        boundary_date,
    )
    .await
    .unwrap();
    assert_eq!(report.new_epoch, Epoch(1));
    assert_eq!(report.rewound, 3);
    assert!(!report.full_registered);

    for sort_key in ["incr#202401010015", "incr#202401010030", "incr#202401010045"] {
        let entry = hx.store.get_entry(&vault(), sort_key).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Ready);
        assert_eq!(entry.epoch, Epoch(1));
        assert_eq!(entry.last_error, None);
    }

    let state = hx.store.get_vault_state(&vault()).await.unwrap().unwrap();
    assert_eq!(state.mode, VaultMode::FullLoad);
    assert_eq!(
        state.last_applied_stoptime,
        Some(StopTime::from_date(boundary_date))
    );
}
