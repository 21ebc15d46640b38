use chrono::{TimeZone, Utc};
use fireball_core::{
    ControllerError, FetchError, FireballData, FireballQuery, FireballSort, FireballSource,
    ObjectRef, SourceError, SyncConfig, SyncController,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct FixtureSource {
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl FireballSource for FixtureSource {
    fn fetch(&self) -> Result<Vec<FireballData>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Fetch(FetchError::Status(503)));
        }
        Ok(vec![
            record(2019, 10.0, 0.5),
            record(2021, -20.0, 20.0),
            record(2020, 30.0, 0.01),
        ])
    }
}

fn record(year: i32, latitude: f64, impact_energy: f64) -> FireballData {
    FireballData {
        timestamp: Utc.with_ymd_and_hms(year, 1, 2, 3, 4, 5).unwrap(),
        latitude,
        longitude: 55.0,
        altitude: 35.0,
        velocity: 18.0,
        radiated_energy: 6.0,
        impact_energy,
    }
}

fn open(dir: &Path, source: Arc<FixtureSource>) -> SyncController {
    SyncController::open_with_source(SyncConfig::for_data_dir(dir), source).unwrap()
}

fn wait_until(mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn visible_count(controller: &SyncController) -> usize {
    controller.fireball_count().unwrap()
}

#[test]
fn open_rejects_config_that_would_hide_imports_from_replay() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SyncConfig::for_data_dir(dir.path());
    config.import_author = config.foreground_author.clone();

    let shared_author =
        SyncController::open_with_source(config.clone(), Arc::new(FixtureSource::default()));
    assert!(matches!(shared_author, Err(ControllerError::Config(_))));
    assert!(!config.store_path.exists());

    let mut config = SyncConfig::for_data_dir(dir.path());
    config.cursor_namespace = "../outside".to_string();
    let escaping = SyncController::open_with_source(config, Arc::new(FixtureSource::default()));
    assert!(matches!(escaping, Err(ControllerError::Config(_))));
}

#[test]
fn imported_records_reach_the_view_through_replay() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open(dir.path(), Arc::default());

    let report = controller.fetch_and_ingest_now().unwrap();
    assert_eq!(report.inserted, 3);
    wait_until(|| visible_count(&controller) == 3);

    let newest_first = controller.fireballs(&FireballQuery::default()).unwrap();
    let years: Vec<_> = newest_first
        .iter()
        .map(|fireball| fireball.data.timestamp.format("%Y").to_string())
        .collect();
    assert_eq!(years, vec!["2021", "2020", "2019"]);

    let largest = controller
        .fireballs(&FireballQuery {
            sort: FireballSort::LargestImpactFirst,
            limit: Some(1),
            ..FireballQuery::default()
        })
        .unwrap();
    assert_eq!(largest[0].data.impact_energy, 20.0);

    let strong = controller
        .fireballs(&FireballQuery {
            min_magnitude: Some(8),
            ..FireballQuery::default()
        })
        .unwrap();
    assert_eq!(strong.len(), 1);

    wait_until(|| dir.path().join("FireballWatch/token.data").exists());
    controller.shutdown();
}

#[test]
fn fire_and_forget_fetch_runs_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FixtureSource::default());
    let controller = open(dir.path(), Arc::clone(&source));

    controller.fetch_fireballs();
    wait_until(|| visible_count(&controller) == 3);
    assert!(source.fetches.load(Ordering::SeqCst) >= 1);
    controller.shutdown();
}

#[test]
fn failed_fetch_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FixtureSource::default());
    source.failing.store(true, Ordering::SeqCst);
    let controller = open(dir.path(), Arc::clone(&source));

    let err = controller.fetch_and_ingest_now().unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Source(SourceError::Fetch(FetchError::Status(503)))
    ));
    controller.fetch_fireballs();
    wait_until(|| source.fetches.load(Ordering::SeqCst) >= 2);
    assert_eq!(visible_count(&controller), 0);
    controller.shutdown();
}

#[test]
fn group_edits_and_deletes_are_visible_and_durable() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open(dir.path(), Arc::default());
    controller.fetch_and_ingest_now().unwrap();
    wait_until(|| visible_count(&controller) == 3);

    assert!(matches!(
        controller.add_group("   "),
        Err(ControllerError::Validation(_))
    ));
    let west = controller.add_group("West").unwrap();
    let east = controller.add_group("East").unwrap();
    let names: Vec<_> = controller
        .groups()
        .unwrap()
        .into_iter()
        .map(|group| group.name)
        .collect();
    assert_eq!(names, vec!["East", "West"]);

    let records = controller.fireballs(&FireballQuery::default()).unwrap();
    let (first, second) = (records[0].id, records[1].id);
    assert!(controller
        .set_fireball_groups(first, BTreeSet::from([west, east]))
        .unwrap());
    assert!(controller
        .set_fireball_groups(second, BTreeSet::from([west]))
        .unwrap());
    assert_eq!(controller.group_members(west).unwrap().len(), 2);
    assert_eq!(controller.group_members(east).unwrap().len(), 1);

    let deleted = controller
        .delete(&[ObjectRef::Group(east), ObjectRef::Fireball(second)])
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(controller.groups().unwrap().len(), 1);
    assert_eq!(visible_count(&controller), 2);
    assert_eq!(
        controller.fireball(first).unwrap().unwrap().groups,
        BTreeSet::from([west])
    );

    assert!(controller.rename_group(west, "  Western ").unwrap());
    assert!(!controller.rename_group(east, "Eastern").unwrap());
    assert!(matches!(
        controller.rename_group(west, ""),
        Err(ControllerError::Validation(_))
    ));
    controller.shutdown();

    let reopened = open(dir.path(), Arc::default());
    assert_eq!(visible_count(&reopened), 2);
    assert_eq!(reopened.group_members(west).unwrap().len(), 1);
    let names: Vec<_> = reopened
        .groups()
        .unwrap()
        .into_iter()
        .map(|group| group.name)
        .collect();
    assert_eq!(names, vec!["Western"]);
    reopened.shutdown();
}

#[test]
fn reads_are_served_while_another_writer_holds_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let controller = open(dir.path(), Arc::default());
    controller.fetch_and_ingest_now().unwrap();
    wait_until(|| visible_count(&controller) == 3);

    let writer = controller.store().connect().unwrap();
    writer.connection().execute_batch("BEGIN IMMEDIATE").unwrap();
    let started_at = Instant::now();
    assert_eq!(visible_count(&controller), 3);
    assert_eq!(controller.groups().unwrap().len(), 0);
    assert!(started_at.elapsed() < Duration::from_secs(1));
    writer.connection().execute_batch("COMMIT").unwrap();
    controller.shutdown();
}

#[test]
fn writes_from_another_process_are_replayed_on_signal() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = open(dir.path(), Arc::default());

    // A second controller on the same file stands in for another process.
    let config = SyncConfig {
        cursor_namespace: "FireballWidget".to_string(),
        foreground_author: "FireballWidget".to_string(),
        ..SyncConfig::for_data_dir(dir.path())
    };
    let writer = SyncController::open_with_source(config, Arc::new(FixtureSource::default()))
        .unwrap();
    let group = writer.add_group("Shared").unwrap();

    watcher.process_remote_change();
    wait_until(|| {
        watcher
            .groups()
            .unwrap()
            .iter()
            .any(|candidate| candidate.id == group)
    });

    writer.shutdown();
    watcher.shutdown();
}
