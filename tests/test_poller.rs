use chrono::{DateTime, TimeZone, Utc};
use goes_viewer::delivery::{LockMarker, Outcome, Poller, UnitProcessor};
use goes_viewer::io::{FetchedObject, ObjectStore, ObjectSummary};
use goes_viewer::{GvError, GvResult, SourceRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const PREFIX: &str = "ABI-L2-MCMIPF";

/// Listing-only store keyed by exact prefix
#[derive(Default)]
struct ListingStore {
    pages: HashMap<String, Vec<ObjectSummary>>,
    requested: Mutex<Vec<String>>,
}

impl ObjectStore for ListingStore {
    fn fetch(&self, source: &SourceRef) -> GvResult<FetchedObject> {
        Err(GvError::NotYetAvailable(source.to_string()))
    }

    fn list(&self, _bucket: &str, prefix: &str) -> GvResult<Vec<ObjectSummary>> {
        self.requested.lock().unwrap().push(prefix.to_string());
        Ok(self.pages.get(prefix).cloned().unwrap_or_default())
    }
}

/// Records what it saw, including whether its lock marker was present
struct RecordingPipeline {
    lock_dir: PathBuf,
    fail_key: Option<&'static str>,
    seen: Mutex<Vec<(String, bool)>>,
}

impl UnitProcessor for RecordingPipeline {
    fn process(&self, unit: &SourceRef) -> GvResult<Outcome> {
        let stamp = unit.last_modified.expect("poller passes last-modified");
        let locked = LockMarker::path_for(&self.lock_dir, stamp).exists();
        self.seen.lock().unwrap().push((unit.key.clone(), locked));
        match self.fail_key {
            Some(k) if unit.key.contains(k) => Err(GvError::MalformedInput(unit.key.clone())),
            _ => Ok(Outcome::Published(PathBuf::from("figs").join(&unit.key))),
        }
    }
}

fn object(key: &str, stamp: DateTime<Utc>) -> ObjectSummary {
    ObjectSummary {
        key: key.to_string(),
        last_modified: stamp,
    }
}

fn setup(
    pages: HashMap<String, Vec<ObjectSummary>>,
    lock_dir: &Path,
    fail_key: Option<&'static str>,
) -> (Arc<ListingStore>, Arc<RecordingPipeline>, Poller<RecordingPipeline>) {
    let store = Arc::new(ListingStore {
        pages,
        ..ListingStore::default()
    });
    let pipeline = Arc::new(RecordingPipeline {
        lock_dir: lock_dir.to_path_buf(),
        fail_key,
        seen: Mutex::new(Vec::new()),
    });
    let poller = Poller::new(store.clone(), Arc::clone(&pipeline), "noaa-goes17", PREFIX, lock_dir);
    (store, pipeline, poller)
}

#[test]
fn test_locked_objects_skipped_and_markers_removed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let now = Utc.with_ymd_and_hms(2022, 10, 28, 18, 20, 0).unwrap();
    let t1 = Utc.with_ymd_and_hms(2022, 10, 28, 18, 4, 31).unwrap();
    let t2 = Utc.with_ymd_and_hms(2022, 10, 28, 18, 14, 31).unwrap();
    let t3 = Utc.with_ymd_and_hms(2022, 10, 28, 18, 19, 2).unwrap();

    let mut pages = HashMap::new();
    pages.insert(
        format!("{}/2022/301/18/", PREFIX),
        vec![
            object("ABI-L2-MCMIPF/2022/301/18/a.nc", t1),
            object("ABI-L2-MCMIPF/2022/301/18/b.nc", t2),
            object("ABI-L2-MCMIPF/2022/301/18/c.nc", t3),
        ],
    );
    let (_, pipeline, poller) = setup(pages, dir.path(), Some("c.nc"));

    // Another run on this host is already working on b.nc
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(LockMarker::path_for(dir.path(), t2), b"").unwrap();

    let summary = poller.run_once(now).expect("poll run failed");
    assert_eq!(summary.listed, 3);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.locked, 1);
    assert_eq!(summary.failed, 1);

    let seen = pipeline.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("ABI-L2-MCMIPF/2022/301/18/a.nc".to_string(), true),
            ("ABI-L2-MCMIPF/2022/301/18/c.nc".to_string(), true),
        ]
    );

    // Markers cleared after success and failure; the foreign one is untouched
    assert!(!LockMarker::path_for(dir.path(), t1).exists());
    assert!(!LockMarker::path_for(dir.path(), t3).exists());
    assert!(LockMarker::path_for(dir.path(), t2).exists());
}

#[test]
fn test_falls_back_to_previous_hour() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    // Day 1 of 2023 at 00:02; the previous hour is day 365 of 2022
    let now = Utc.with_ymd_and_hms(2023, 1, 1, 0, 2, 0).unwrap();
    let stamp = Utc.with_ymd_and_hms(2022, 12, 31, 23, 58, 40).unwrap();

    let mut pages = HashMap::new();
    pages.insert(
        format!("{}/2022/365/23/", PREFIX),
        vec![object("ABI-L2-MCMIPF/2022/365/23/late.nc", stamp)],
    );
    let (store, pipeline, poller) = setup(pages, dir.path(), None);

    let summary = poller.run_once(now).expect("poll run failed");
    assert_eq!(summary.published, 1);
    assert_eq!(
        *store.requested.lock().unwrap(),
        vec![
            "ABI-L2-MCMIPF/2023/001/00/".to_string(),
            "ABI-L2-MCMIPF/2022/365/23/".to_string()
        ]
    );
    assert_eq!(pipeline.seen.lock().unwrap().len(), 1);
}
