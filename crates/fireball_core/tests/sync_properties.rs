use chrono::{TimeZone, Utc};
use fireball_core::service::foreground::ForegroundContext;
use fireball_core::service::view_context::ViewContext;
use fireball_core::{
    decode_payload, BatchIngestor, ChangeOp, ChangeReplayEngine, ChangeToken, Fireball,
    FireballData, FireballGroup, FireballId, FireballPatch, FireballQuery, GroupId,
    HistoryCursorStore, IngestionError, MergePolicy, PersistentStore, ReplayError, ReplayOutcome,
    StoreAccess, FOREGROUND_AUTHOR, IMPORT_AUTHOR,
};
use std::collections::BTreeSet;

const OTHER_WRITER: &str = "Another Writer";

fn data(latitude: f64) -> FireballData {
    FireballData {
        timestamp: Utc.with_ymd_and_hms(2021, 11, 12, 13, 14, 15).unwrap(),
        latitude,
        longitude: 100.0,
        altitude: 30.0,
        velocity: 16.0,
        radiated_energy: 4.0,
        impact_energy: 1.0,
    }
}

fn open_store(dir: &tempfile::TempDir) -> PersistentStore {
    PersistentStore::open(dir.path().join("FireballWatch.sqlite")).unwrap()
}

fn import_one(store: &PersistentStore) -> FireballId {
    let record = Fireball::new(data(10.0));
    let id = record.id;
    store
        .connect()
        .unwrap()
        .save(IMPORT_AUTHOR, &[ChangeOp::InsertFireball { fireball: record }])
        .unwrap();
    id
}

fn set_altitude(store: &PersistentStore, id: FireballId, altitude: f64) -> ChangeToken {
    store
        .connect()
        .unwrap()
        .save(
            OTHER_WRITER,
            &[ChangeOp::UpdateFireball {
                id,
                patch: FireballPatch {
                    altitude: Some(altitude),
                    ..FireballPatch::default()
                },
            }],
        )
        .unwrap()
        .unwrap()
}

fn loaded_view(store: &PersistentStore, policy: MergePolicy) -> ViewContext {
    let snapshot = store.connect().unwrap().load_snapshot().unwrap();
    ViewContext::from_snapshot(snapshot, policy)
}

fn spawn_foreground(store: &PersistentStore) -> ForegroundContext {
    ForegroundContext::spawn(
        loaded_view(store, MergePolicy::default()),
        Box::new(store.connect().unwrap()),
        FOREGROUND_AUTHOR,
    )
    .unwrap()
}

#[test]
fn replaying_the_same_batch_twice_matches_replaying_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let mut once = loaded_view(&store, MergePolicy::default());
    let mut twice = loaded_view(&store, MergePolicy::default());

    let id = import_one(&store);
    set_altitude(&store, id, 12.0);
    store
        .connect()
        .unwrap()
        .save(
            OTHER_WRITER,
            &[ChangeOp::InsertGroup {
                group: FireballGroup::new("dupes").unwrap(),
            }],
        )
        .unwrap();
    let batch = store
        .connect()
        .unwrap()
        .history_after(None, FOREGROUND_AUTHOR)
        .unwrap();
    assert_eq!(batch.len(), 3);

    once.merge_transactions(&batch);
    twice.merge_transactions(&batch);
    twice.merge_transactions(&batch);

    assert_eq!(
        once.fireballs(&FireballQuery::default()),
        twice.fireballs(&FireballQuery::default())
    );
    assert_eq!(once.groups(), twice.groups());
    assert_eq!(twice.fireball(id).unwrap().data.altitude, 12.0);
}

#[test]
fn newer_transaction_wins_a_shared_field() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let id = import_one(&store);
    let foreground = spawn_foreground(&store);

    set_altitude(&store, id, 10.0);
    let newest = set_altitude(&store, id, 20.0);

    let cursor = HistoryCursorStore::new(dir.path(), "FireballWatch");
    let mut engine =
        ChangeReplayEngine::new(store.connect().unwrap(), foreground.handle(), cursor);
    // The first cycle also sees the import, which the loaded view skips.
    assert_eq!(
        engine.run_cycle().unwrap(),
        ReplayOutcome::Merged {
            transactions: 3,
            token: newest
        }
    );

    let altitude = foreground
        .perform_and_wait(move |state| state.view.fireball(id).map(|f| f.data.altitude))
        .unwrap();
    assert_eq!(altitude, Some(20.0));
    foreground.shutdown();
}

fn pending_edit_against_foreign_change(
    policy: MergePolicy,
    writer: &str,
) -> (BTreeSet<GroupId>, f64) {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let id = import_one(&store);
    let group = FireballGroup::new("local pick").unwrap();
    let group_id = group.id;
    store
        .connect()
        .unwrap()
        .save(OTHER_WRITER, &[ChangeOp::InsertGroup { group }])
        .unwrap();

    let mut view = loaded_view(&store, policy);
    let anchor = view.anchor();
    assert!(view.edit_fireball(id, FireballPatch::groups(BTreeSet::from([group_id]))));

    store
        .connect()
        .unwrap()
        .save(
            writer,
            &[ChangeOp::UpdateFireball {
                id,
                patch: FireballPatch {
                    groups: Some(BTreeSet::new()),
                    altitude: Some(77.0),
                    ..FireballPatch::default()
                },
            }],
        )
        .unwrap();
    let batch = store
        .connect()
        .unwrap()
        .history_after(anchor, FOREGROUND_AUTHOR)
        .unwrap();
    view.merge_transactions(&batch);

    let visible = view.fireball(id).unwrap();
    (visible.groups, visible.data.altitude)
}

#[test]
fn pending_local_field_beats_foreign_value_and_other_fields_merge() {
    let (groups, altitude) =
        pending_edit_against_foreign_change(MergePolicy::PropertyObjectTrump, OTHER_WRITER);
    assert_eq!(groups.len(), 1);
    assert_eq!(altitude, 77.0);
}

#[test]
fn pending_local_field_beats_bulk_import_value() {
    let (groups, altitude) =
        pending_edit_against_foreign_change(MergePolicy::PropertyObjectTrump, IMPORT_AUTHOR);
    assert_eq!(groups.len(), 1);
    assert_eq!(altitude, 77.0);
}

#[test]
fn store_trump_policy_lets_foreign_value_win() {
    let (groups, altitude) =
        pending_edit_against_foreign_change(MergePolicy::PropertyStoreTrump, OTHER_WRITER);
    assert!(groups.is_empty());
    assert_eq!(altitude, 77.0);
}

#[test]
fn persisted_token_tracks_newest_merged_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let id = import_one(&store);
    let foreground = spawn_foreground(&store);
    let cursor = HistoryCursorStore::new(dir.path(), "FireballWatch");
    let mut engine = ChangeReplayEngine::new(
        store.connect().unwrap(),
        foreground.handle(),
        cursor.clone(),
    );

    for altitude in [40.0, 41.0, 42.0] {
        let token = set_altitude(&store, id, altitude);
        engine.run_cycle().unwrap();
        assert_eq!(cursor.load(), Some(token));
        assert_eq!(engine.last_token(), Some(token));
    }
    assert_eq!(engine.run_cycle().unwrap(), ReplayOutcome::UpToDate);

    let merged_through = cursor.load();
    set_altitude(&store, id, 43.0);
    foreground.shutdown();
    assert!(matches!(
        engine.run_cycle(),
        Err(ReplayError::MergeTargetClosed)
    ));
    assert_eq!(cursor.load(), merged_through);
    assert_eq!(engine.last_token(), merged_through);

    let foreground = spawn_foreground(&store);
    let resumed = ChangeReplayEngine::new(store.connect().unwrap(), foreground.handle(), cursor);
    assert_eq!(resumed.last_token(), merged_through);
    foreground.shutdown();
}

#[test]
fn interrupted_bulk_import_leaves_no_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .connect()
        .unwrap()
        .connection()
        .execute_batch(
            "CREATE TRIGGER fail_fiftieth_insert BEFORE INSERT ON fireballs
             WHEN (SELECT COUNT(*) FROM fireballs) >= 49
             BEGIN
                SELECT RAISE(ABORT, 'simulated store failure');
             END;",
        )
        .unwrap();

    let batch: Vec<FireballData> = (0..50).map(|index| data(f64::from(index))).collect();
    let err = BatchIngestor::new(store.clone()).ingest(batch).unwrap_err();
    assert!(matches!(err, IngestionError::Store(_)));

    let conn = store.connect().unwrap();
    assert!(conn.load_snapshot().unwrap().fireballs.is_empty());
    assert!(conn.history_after(None, "nobody").unwrap().is_empty());
}

#[test]
fn hemisphere_flags_and_dateless_rows() {
    let payload = br#"{
        "signature": {"source": "NASA/JPL Fireball Data API", "version": "1.0"},
        "count": "2",
        "fields": ["date","energy","impact-e","lat","lat-dir","lon","lon-dir","alt","vel"],
        "data": [
            ["2020-01-01 00:00:00","1.0","2.0","10","S","20","W","5","300"],
            [null,"1.0","2.0","10","S","20","W","5","300"]
        ]
    }"#;
    let decoded = decode_payload(payload).unwrap();
    assert_eq!(decoded.records.len(), 1);
    assert_eq!(decoded.dropped_rows, 1);
    assert_eq!(decoded.records[0].latitude, -10.0);
    assert_eq!(decoded.records[0].longitude, -20.0);
}

#[test]
fn empty_ingest_never_touches_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("FireballWatch.sqlite");
    let store = PersistentStore::open(&path).unwrap();
    for suffix in ["", "-wal", "-shm"] {
        let file = dir.path().join(format!("FireballWatch.sqlite{suffix}"));
        if file.exists() {
            std::fs::remove_file(file).unwrap();
        }
    }

    let report = BatchIngestor::new(store).ingest(Vec::new()).unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.token, None);
    assert!(!path.exists());
}
