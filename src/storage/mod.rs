//! Rolling SQLite archive storage

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Deserialize;

mod backend;
mod schedule;
mod store;
mod transaction;
mod value;

#[cfg(test)]
mod tests;

pub use backend::{Backend, SqliteBackend};
pub use schedule::{archive_path, ArchivePeriod, ArchiveSchedule, PeriodUnit};
pub use store::{topic_key, ArchiveStore, Metadata, TopicId};
pub use transaction::StoreTransaction;
pub use value::SqlValue;

/// Common error type for storage operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Transaction failure: {0}")]
    TransactionFailure(String),
    #[error("Rotation failed: {0}")]
    RotationFailed(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Historian writer stopped")]
    WorkerStopped,
}

impl Error {
    /// A redelivery of the same batch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransactionFailure(_))
    }

    /// The store must not be used again until the process restarts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RotationFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

const MASKED_KEYS: [&str; 4] = ["pass", "passwd", "password", "pw"];

/// Connection parameters for the active storage file.
///
/// Everything besides `database` is a backend-specific option.
#[derive(Clone, Deserialize)]
pub struct ConnectionParams {
    pub database: PathBuf,
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ConnectionParams {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"database", &self.database);
        for (key, value) in &self.options {
            if MASKED_KEYS.contains(&key.as_str()) {
                map.entry(key, &"********");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// Table name overrides
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub table_prefix: String,
    pub data_table: String,
    pub topics_table: String,
    pub meta_table: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            data_table: "data".to_string(),
            topics_table: "topics".to_string(),
            meta_table: "meta".to_string(),
        }
    }
}

impl TableNames {
    pub fn data(&self) -> String {
        self.prefixed(&self.data_table)
    }

    pub fn topics(&self) -> String {
        self.prefixed(&self.topics_table)
    }

    pub fn meta(&self) -> String {
        self.prefixed(&self.meta_table)
    }

    fn prefixed(&self, name: &str) -> String {
        if self.table_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.table_prefix, name)
        }
    }

    /// Names are spliced into SQL, so only plain identifiers are accepted.
    pub fn validate(&self) -> Result<()> {
        for name in [self.data(), self.topics(), self.meta()] {
            if !is_identifier(&name) {
                return Err(Error::InvalidConfiguration(format!(
                    "Table name is not a valid identifier: {:?}",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
