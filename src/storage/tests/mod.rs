
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::*;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tempfile::{tempdir, TempDir};

pub fn test_params(dir: &TempDir) -> ConnectionParams {
    ConnectionParams::new(dir.path().join("historian_test.sqlite"))
}

pub fn open_store(dir: &TempDir, period: i64, unit: &str) -> ArchiveStore {
    let mut store: ArchiveStore =
        ArchiveStore::open(test_params(dir), TableNames::default(), period, unit).unwrap();
    store.setup_schema().unwrap();
    store
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn db_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

pub fn table_names(path: &Path) -> HashSet<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
        .unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .map(|name| name.unwrap())
        .collect()
}

pub fn row_count(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}
