use super::*;
use chrono::{Duration, Local};

#[test]
fn test_rotation_clears_caches() {
    let dir = tempdir().unwrap();
    let mut historian = open_historian(&dir, "1h");
    let units = meta(&[("units", "degF")]);

    historian
        .publish_batch(&[Record::new(ts(1), "Zone/Temp", 71).with_metadata(units.clone())])
        .unwrap();
    assert_eq!(historian.cached_topic_count(), 1);

    let now = Local::now();
    historian.store_mut().set_next_rotation(now);
    assert!(historian.run_maintenance_at(now, None, None).unwrap());
    assert_eq!(historian.cached_topic_count(), 0);
    assert_eq!(historian.stats().rotations, 1);

    // the new file must describe its own topics and metadata
    historian
        .publish_batch(&[Record::new(ts(2), "Zone/Temp", 72).with_metadata(units.clone())])
        .unwrap();
    let database = historian.store().database_path().to_path_buf();
    assert_eq!(row_count(&database, "topics"), 1);
    assert_eq!(row_count(&database, "data"), 1);
    let id = historian.cached_topic_id("zone/temp").unwrap();
    assert_eq!(stored_metadata(&database, id), Some(units));
}

#[test]
fn test_maintenance_not_due() {
    let dir = tempdir().unwrap();
    let mut historian = open_historian(&dir, "1d");
    historian.publish_batch(&[Record::new(ts(1), "a/b", 1)]).unwrap();

    assert!(!historian.run_maintenance(None, None).unwrap());
    assert_eq!(db_files(dir.path()).len(), 1);
    assert_eq!(historian.cached_topic_count(), 1);
    assert_eq!(historian.stats().rotations, 0);
}

#[test]
fn test_limits_are_accepted() {
    let dir = tempdir().unwrap();
    let mut historian = open_historian(&dir, "1d");
    historian.publish_batch(&[Record::new(ts(1), "a/b", 1)]).unwrap();

    let limit = Utc::now() - Duration::days(30);
    assert!(!historian.run_maintenance(Some(limit), Some(0.001)).unwrap());
    assert_eq!(row_count(historian.store().database_path(), "data"), 1);

    let now = Local::now();
    historian.store_mut().set_next_rotation(now);
    assert!(historian.run_maintenance_at(now, Some(limit), Some(2.5)).unwrap());
}

#[test]
fn test_rotation_failure_is_fatal() {
    let dir = tempdir().unwrap();
    let db_dir = dir.path().join("nested");
    let config = HistorianConfig::new(db_dir.join("historian_test.sqlite"), "1d");
    let mut historian: Historian = Historian::new(&config).unwrap();

    std::fs::remove_dir_all(&db_dir).unwrap();
    let now = Local::now();
    historian.store_mut().set_next_rotation(now);

    let err = historian.run_maintenance_at(now, None, None).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        historian.publish_batch(&[Record::new(ts(1), "a/b", 1)]),
        Err(Error::RotationFailed(_))
    ));
    assert!(matches!(historian.run_maintenance(None, None), Err(Error::RotationFailed(_))));
    historian.close().unwrap();
}
