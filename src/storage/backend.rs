use std::path::Path;
use std::time::Duration;

use rusqlite::{params_from_iter, Connection};

use super::{ConnectionParams, Error, Result, SqlValue};

const JOURNAL_MODES: [&str; 6] = ["delete", "truncate", "persist", "memory", "wal", "off"];
const SYNC_MODES: [&str; 4] = ["off", "normal", "full", "extra"];

/// Minimal relational capability the archive store is written against.
///
/// A backend owns exactly one open storage file. Transactions are driven
/// through `execute_batch` with plain `BEGIN`/`COMMIT`/`ROLLBACK`.
pub trait Backend: Sized {
    fn open(params: &ConnectionParams) -> Result<Self>;

    /// Releases the file handle. The file must be safe to rename afterwards.
    fn close(self) -> Result<()>;

    /// Runs one statement and returns the number of changed rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize>;

    fn execute_batch(&mut self, sql: &str) -> Result<()>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>>;

    fn last_insert_id(&self) -> i64;
}

pub struct SqliteBackend {
    conn: Connection,
}

impl Backend for SqliteBackend {
    fn open(params: &ConnectionParams) -> Result<Self> {
        ensure_parent_dir(&params.database)?;
        let conn = Connection::open(&params.database)?;
        apply_options(&conn, params)?;
        Ok(Self { conn })
    }

    fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| Error::Sqlite(err))
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            (0..columns)
                .map(|idx| row.get_ref(idx).map(SqlValue::from))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn last_insert_id(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn apply_options(conn: &Connection, params: &ConnectionParams) -> Result<()> {
    for (key, value) in &params.options {
        match key.as_str() {
            "timeout" => {
                let timeout = value
                    .as_f64()
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .ok_or_else(|| {
                        Error::InvalidConfiguration(format!(
                            "timeout must be a non-negative number of seconds: {}",
                            value
                        ))
                    })?;
                conn.busy_timeout(timeout)?;
            }
            "journal_mode" => {
                let mode = pragma_choice(key, value, &JOURNAL_MODES)?;
                conn.execute_batch(&format!("PRAGMA journal_mode = {};", mode))?;
            }
            "synchronous" => {
                let mode = pragma_choice(key, value, &SYNC_MODES)?;
                conn.execute_batch(&format!("PRAGMA synchronous = {};", mode))?;
            }
            other => log::debug!("Ignoring connection option {:?}", other),
        }
    }
    Ok(())
}

fn pragma_choice(key: &str, value: &serde_json::Value, allowed: &[&str]) -> Result<String> {
    value
        .as_str()
        .map(str::to_ascii_lowercase)
        .filter(|mode| allowed.contains(&mode.as_str()))
        .ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "{} must be one of {}: {}",
                key,
                allowed.join(", "),
                value
            ))
        })
}
