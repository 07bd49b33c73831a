use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat, Utc};

use super::backend::{Backend, SqliteBackend};
use super::schedule::{archive_path, ArchivePeriod, ArchiveSchedule};
use super::transaction::StoreTransaction;
use super::{ConnectionParams, Error, Result, SqlValue, TableNames};

pub type TopicId = i64;

/// Key/value description of a topic (units, type, ...)
pub type Metadata = BTreeMap<String, String>;

/// Case-insensitive lookup key for a topic name
pub fn topic_key(name: &str) -> String {
    name.to_lowercase()
}

enum StoreState<B> {
    Open(B),
    /// Left behind by a rotation that did not complete.
    Failed(String),
}

/// SQL for one set of table names, built once at open.
struct Statements {
    schema: String,
    select_topic: String,
    insert_topic: String,
    rename_topic: String,
    all_topics: String,
    upsert_meta: String,
    all_meta: String,
    insert_data: String,
}

impl Statements {
    fn new(tables: &TableNames) -> Self {
        let data = tables.data();
        let topics = tables.topics();
        let meta = tables.meta();

        Self {
            schema: format!(
                "CREATE TABLE IF NOT EXISTS {data} (
                    ts TIMESTAMP NOT NULL,
                    topic_id INTEGER NOT NULL,
                    value_string TEXT NOT NULL,
                    UNIQUE(topic_id, ts));
                 CREATE INDEX IF NOT EXISTS {data}_ts_idx ON {data} (ts ASC);
                 CREATE TABLE IF NOT EXISTS {topics} (
                    topic_id INTEGER PRIMARY KEY,
                    topic_name TEXT NOT NULL,
                    topic_key TEXT NOT NULL UNIQUE);
                 CREATE TABLE IF NOT EXISTS {meta} (
                    topic_id INTEGER PRIMARY KEY,
                    metadata TEXT NOT NULL);"
            ),
            select_topic: format!("SELECT topic_id FROM {topics} WHERE topic_key = ?1"),
            insert_topic: format!("INSERT INTO {topics} (topic_name, topic_key) VALUES (?1, ?2)"),
            rename_topic: format!("UPDATE {topics} SET topic_name = ?2 WHERE topic_id = ?1"),
            all_topics: format!("SELECT topic_id, topic_name FROM {topics}"),
            upsert_meta: format!("INSERT OR REPLACE INTO {meta} (topic_id, metadata) VALUES (?1, ?2)"),
            all_meta: format!("SELECT topic_id, metadata FROM {meta}"),
            insert_data: format!(
                "INSERT OR IGNORE INTO {data} (ts, topic_id, value_string) VALUES (?1, ?2, ?3)"
            ),
        }
    }
}

/// Owns the active storage file, its schema, and its rotation schedule.
pub struct ArchiveStore<B: Backend = SqliteBackend> {
    params: ConnectionParams,
    tables: TableNames,
    sql: Statements,
    schedule: ArchiveSchedule,
    state: StoreState<B>,
}

impl<B: Backend> ArchiveStore<B> {
    /// Validates the archive period, then opens (or creates) the storage file.
    ///
    /// Nothing is created on disk when validation fails.
    pub fn open(params: ConnectionParams, tables: TableNames, period: i64, unit: &str) -> Result<Self> {
        let period = ArchivePeriod::new(period, unit)?;
        Self::with_period(params, tables, period)
    }

    pub fn with_period(params: ConnectionParams, tables: TableNames, period: ArchivePeriod) -> Result<Self> {
        tables.validate()?;

        let base = file_created(&params.database)?.unwrap_or_else(Local::now);
        let schedule = ArchiveSchedule::starting_at(period, base)?;
        let backend = B::open(&params)?;

        Ok(Self {
            sql: Statements::new(&tables),
            params,
            tables,
            schedule,
            state: StoreState::Open(backend),
        })
    }

    pub fn database_path(&self) -> &Path {
        &self.params.database
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn period(&self) -> ArchivePeriod {
        self.schedule.period()
    }

    pub fn next_rotation(&self) -> DateTime<Local> {
        self.schedule.next_rotation()
    }

    /// Moves the next rotation instant, e.g. to force an early archive.
    pub fn set_next_rotation(&mut self, at: DateTime<Local>) {
        self.schedule.set_next_rotation(at);
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state, StoreState::Open(_))
    }

    pub(super) fn backend(&mut self) -> Result<&mut B> {
        match &mut self.state {
            StoreState::Open(backend) => Ok(backend),
            StoreState::Failed(reason) => Err(Error::RotationFailed(reason.clone())),
        }
    }

    /// Creates the data, topics and meta tables if missing.
    pub fn setup_schema(&mut self) -> Result<()> {
        let sql = self.sql.schema.clone();
        self.backend()?.execute_batch(&sql)
    }

    /// Begins a transaction that lasts until the guard is committed,
    /// rolled back, or dropped.
    pub fn transaction(&mut self) -> Result<StoreTransaction<'_, B>> {
        StoreTransaction::begin(self)
    }

    pub fn resolve_or_create_topic(&mut self, name: &str) -> Result<TopicId> {
        let key = topic_key(name);
        let select = self.sql.select_topic.clone();
        let insert = self.sql.insert_topic.clone();
        let backend = self.backend()?;

        let rows = backend.query(&select, &[SqlValue::from(key.as_str())])?;
        if let Some(row) = rows.first() {
            return row
                .first()
                .and_then(SqlValue::as_integer)
                .ok_or_else(|| Error::Corrupt(format!("topic id for {:?}", name)));
        }

        backend.execute(&insert, &[SqlValue::from(name), SqlValue::from(key)])?;
        Ok(backend.last_insert_id())
    }

    /// Rewrites the display casing of a topic. The identifier is unchanged.
    pub fn update_topic_name(&mut self, topic_id: TopicId, display_name: &str) -> Result<()> {
        let sql = self.sql.rename_topic.clone();
        self.backend()?
            .execute(&sql, &[SqlValue::from(topic_id), SqlValue::from(display_name)])?;
        Ok(())
    }

    /// Unconditional write; change detection is up to the caller.
    pub fn upsert_metadata(&mut self, topic_id: TopicId, metadata: &Metadata) -> Result<()> {
        let sql = self.sql.upsert_meta.clone();
        let json = serde_json::to_string(metadata)?;
        self.backend()?
            .execute(&sql, &[SqlValue::from(topic_id), SqlValue::from(json)])?;
        Ok(())
    }

    /// Returns false when a row for this topic and timestamp already exists.
    pub fn insert_data(
        &mut self,
        ts: DateTime<Utc>,
        topic_id: TopicId,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let sql = self.sql.insert_data.clone();
        let params = [
            SqlValue::from(ts.to_rfc3339_opts(SecondsFormat::Micros, false)),
            SqlValue::from(topic_id),
            SqlValue::from(serde_json::to_string(value)?),
        ];
        let changed = self.backend()?.execute(&sql, &params)?;
        Ok(changed == 1)
    }

    /// Lowercased name to id, and lowercased name to display name.
    pub fn topic_map(&mut self) -> Result<(HashMap<String, TopicId>, HashMap<String, String>)> {
        let sql = self.sql.all_topics.clone();
        let rows = self.backend()?.query(&sql, &[])?;

        let mut ids = HashMap::with_capacity(rows.len());
        let mut names = HashMap::with_capacity(rows.len());
        for row in rows {
            let mut row = row.into_iter();
            let (Some(id), Some(name)) = (
                row.next().as_ref().and_then(SqlValue::as_integer),
                row.next().and_then(SqlValue::into_text),
            ) else {
                return Err(Error::Corrupt(format!("unexpected row in {}", self.tables.topics())));
            };
            let key = topic_key(&name);
            ids.insert(key.clone(), id);
            names.insert(key, name);
        }

        Ok((ids, names))
    }

    pub fn metadata_map(&mut self) -> Result<HashMap<TopicId, Metadata>> {
        let sql = self.sql.all_meta.clone();
        let rows = self.backend()?.query(&sql, &[])?;

        let mut meta = HashMap::with_capacity(rows.len());
        for row in rows {
            let (Some(id), Some(json)) = (
                row.first().and_then(SqlValue::as_integer),
                row.get(1).and_then(SqlValue::as_text),
            ) else {
                return Err(Error::Corrupt(format!("unexpected row in {}", self.tables.meta())));
            };
            meta.insert(id, serde_json::from_str(json)?);
        }

        Ok(meta)
    }

    /// Archives the active file if `now` has reached the scheduled instant.
    ///
    /// Returns whether a rotation happened. A failure part-way through leaves
    /// the store unusable: this and every later call return `RotationFailed`.
    pub fn check_and_rotate(&mut self, now: DateTime<Local>) -> Result<bool> {
        self.backend()?;
        if !self.schedule.is_due(now) {
            return Ok(false);
        }

        // scheduled before anything is moved
        let next = self.schedule.following(now)?;
        let target = self.unused_archive_path(now);
        match self.rotate(&target) {
            Ok(()) => {
                log::info!(
                    "Archived {} to {}",
                    self.params.database.display(),
                    target.display()
                );
                self.schedule.reschedule(next);
                Ok(true)
            }
            Err(err) => {
                let reason = format!(
                    "archiving {} to {}: {}",
                    self.params.database.display(),
                    target.display(),
                    err
                );
                log::error!("Rotation failed, store is unusable: {}", reason);
                self.state = StoreState::Failed(reason.clone());
                Err(Error::RotationFailed(reason))
            }
        }
    }

    fn rotate(&mut self, target: &Path) -> Result<()> {
        let interrupted = StoreState::Failed("rotation interrupted".to_string());
        let backend = match std::mem::replace(&mut self.state, interrupted) {
            StoreState::Open(backend) => backend,
            StoreState::Failed(reason) => return Err(Error::RotationFailed(reason)),
        };

        backend.close()?;
        fs::rename(&self.params.database, target)?;
        self.state = StoreState::Open(B::open(&self.params)?);
        self.setup_schema()
    }

    /// Archive names are never reused; a counter is appended on collision.
    fn unused_archive_path(&self, now: DateTime<Local>) -> PathBuf {
        let stamp = self.schedule.format_stamp(now);
        let mut target = archive_path(&self.params.database, &stamp);
        let mut n = 1;
        while target.exists() {
            target = archive_path(&self.params.database, &format!("{}-{}", stamp, n));
            n += 1;
        }
        target
    }

    /// Closes the active file.
    pub fn close(self) -> Result<()> {
        match self.state {
            StoreState::Open(backend) => backend.close(),
            StoreState::Failed(_) => Ok(()),
        }
    }
}

/// Birth time where the filesystem records one, otherwise last modification.
fn file_created(path: &Path) -> Result<Option<DateTime<Local>>> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let created = meta.created().or_else(|_| meta.modified())?;
    Ok(Some(DateTime::<Local>::from(created)))
}
