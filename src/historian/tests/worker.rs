use super::*;

#[test]
fn test_worker_publish_and_shutdown() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, "1d");
    let database = config.connection.params.database.clone();
    let worker = HistorianWorker::spawn(config).unwrap();

    let outcome = worker
        .publish(vec![
            Record::new(ts(1), "Site/Meter", 1.5),
            Record::new(ts(2), "site/meter", 1.6),
        ])
        .unwrap();
    assert_eq!(outcome, BatchOutcome::Handled { records: 2, inserted: 2 });

    let outcome = worker.publish(vec![Record::new(ts(1), "site/meter", 1.5)]).unwrap();
    assert_eq!(outcome, BatchOutcome::NotHandled);

    assert!(!worker.run_maintenance(None, None).unwrap());

    let stats = worker.stats();
    assert_eq!(stats.batches_committed, 1);
    assert_eq!(stats.rows_inserted, 2);
    assert_eq!(stats.duplicates_skipped, 1);
    assert_eq!(stats.topics_created, 1);

    worker.shutdown().unwrap();
    assert_eq!(row_count(&database, "data"), 2);
}

#[test]
fn test_worker_reports_invalid_config() {
    let dir = tempdir().unwrap();
    let result = HistorianWorker::spawn(test_config(&dir, "0d"));

    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    assert!(db_files(dir.path()).is_empty());
}

#[test]
fn test_worker_scheduled_maintenance() {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir, "1d");
    config.maintenance_interval = Some(1);
    let worker = HistorianWorker::spawn(config).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(1200));

    assert!(worker.publish(vec![Record::new(ts(1), "a/b", 1)]).unwrap().is_handled());
    assert_eq!(worker.stats().rotations, 0);
    assert_eq!(db_files(dir.path()).len(), 1);
    worker.shutdown().unwrap();
}

#[test]
fn test_worker_shuts_down_on_drop() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, "1d");
    let database = config.connection.params.database.clone();
    {
        let worker = HistorianWorker::spawn(config).unwrap();
        worker.publish(vec![Record::new(ts(1), "a/b", 1)]).unwrap();
    }

    // the file is closed, a new writer can open it
    let reopened: Historian = Historian::new(&HistorianConfig::new(database, "1d")).unwrap();
    assert_eq!(reopened.cached_topic_count(), 1);
}

#[test]
fn test_worker_with_unrepresentable_interval() {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir, "1d");
    config.maintenance_interval = Some(u64::MAX);
    let worker = HistorianWorker::spawn(config).unwrap();

    assert!(worker.publish(vec![Record::new(ts(1), "a/b", 1)]).unwrap().is_handled());
    assert!(!worker.run_maintenance(None, None).unwrap());
    assert_eq!(worker.stats().rows_inserted, 1);
    worker.shutdown().unwrap();
}
