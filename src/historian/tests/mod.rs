pub mod maintenance;
pub mod worker;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use super::*;
use crate::storage::{ConnectionParams, Error, PeriodUnit, SqlValue};
use chrono::TimeZone;
use rusqlite::Connection;
use tempfile::{tempdir, TempDir};

pub fn test_config(dir: &TempDir, archive_period: &str) -> HistorianConfig {
    HistorianConfig::new(dir.path().join("historian_test.sqlite"), archive_period)
}

pub fn open_historian(dir: &TempDir, archive_period: &str) -> Historian {
    Historian::new(&test_config(dir, archive_period)).unwrap()
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn db_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

pub fn row_count(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

pub fn topic_names(path: &Path) -> HashSet<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT topic_name FROM topics").unwrap();
    stmt.query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .map(|name| name.unwrap())
        .collect()
}

pub fn stored_metadata(path: &Path, topic_id: TopicId) -> Option<Metadata> {
    let conn = Connection::open(path).unwrap();
    conn.query_row("SELECT metadata FROM meta WHERE topic_id = ?1", [topic_id], |row| {
        row.get::<_, String>(0)
    })
    .ok()
    .map(|json| serde_json::from_str(&json).unwrap())
}

/// SQLite backend that fails on request.
///
/// `fail_commits`: number of `COMMIT`s to reject before letting them through.
/// `fail_rollbacks`: number of `ROLLBACK`s to reject.
/// `fail_data_insert_after`: data rows accepted before one insert fails.
pub struct FlakyBackend {
    inner: SqliteBackend,
    fail_commits: u64,
    fail_rollbacks: u64,
    fail_data_insert_after: Option<u64>,
}

impl Backend for FlakyBackend {
    fn open(params: &ConnectionParams) -> crate::storage::Result<Self> {
        let option = |key: &str| params.options.get(key).and_then(serde_json::Value::as_u64);
        Ok(Self {
            inner: SqliteBackend::open(params)?,
            fail_commits: option("fail_commits").unwrap_or(0),
            fail_rollbacks: option("fail_rollbacks").unwrap_or(0),
            fail_data_insert_after: option("fail_data_insert_after"),
        })
    }

    fn close(self) -> crate::storage::Result<()> {
        self.inner.close()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> crate::storage::Result<usize> {
        if sql.starts_with("INSERT OR IGNORE INTO data") {
            match self.fail_data_insert_after {
                Some(0) => {
                    self.fail_data_insert_after = None;
                    return Err(io::Error::new(io::ErrorKind::Other, "injected insert failure").into());
                }
                Some(n) => self.fail_data_insert_after = Some(n - 1),
                None => {}
            }
        }
        self.inner.execute(sql, params)
    }

    fn execute_batch(&mut self, sql: &str) -> crate::storage::Result<()> {
        if sql == "COMMIT" && self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected commit failure").into());
        }
        if sql == "ROLLBACK" && self.fail_rollbacks > 0 {
            self.fail_rollbacks -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected rollback failure").into());
        }
        self.inner.execute_batch(sql)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> crate::storage::Result<Vec<Vec<SqlValue>>> {
        self.inner.query(sql, params)
    }

    fn last_insert_id(&self) -> i64 {
        self.inner.last_insert_id()
    }
}

pub fn flaky_historian(dir: &TempDir, option: &str, value: u64) -> Historian<FlakyBackend> {
    let mut config = test_config(dir, "1d");
    config
        .connection
        .params
        .options
        .insert(option.to_string(), serde_json::json!(value));
    Historian::new(&config).unwrap()
}
