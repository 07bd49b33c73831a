//! Batched, transactional ingestion on top of the archive store

use std::collections::HashMap;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{
    topic_key, ArchiveStore, Backend, Metadata, Result, SqliteBackend, StoreTransaction, TopicId,
};

mod config;
mod worker;

#[cfg(test)]
mod tests;

pub use config::{ConnectionConfig, HistorianConfig};
pub use worker::HistorianWorker;

pub const VERSION: &str = "1.0";

/// One timestamped value published on a topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Record {
    pub fn new(
        timestamp: DateTime<Utc>,
        topic: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            timestamp,
            topic: topic.into(),
            value: value.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What the delivery layer is told about a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Committed; every record in the batch counts as handled.
    Handled { records: usize, inserted: usize },
    /// Nothing new to write, nothing committed.
    NotHandled,
}

impl BatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, BatchOutcome::Handled { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistorianStats {
    pub batches_committed: usize,
    pub rows_inserted: usize,
    pub duplicates_skipped: usize,
    pub topics_created: usize,
    pub topics_renamed: usize,
    pub metadata_writes: usize,
    pub rollbacks: usize,
    pub rotations: usize,
}

/// Mirrors the topics and meta tables of the active file.
#[derive(Default)]
struct TopicCache {
    ids: HashMap<String, TopicId>,
    names: HashMap<String, String>,
    meta: HashMap<TopicId, Metadata>,
}

impl TopicCache {
    fn load<B: Backend>(store: &mut ArchiveStore<B>) -> Result<Self> {
        let (ids, names) = store.topic_map()?;
        let meta = store.metadata_map()?;
        Ok(Self { ids, names, meta })
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.names.clear();
        self.meta.clear();
    }

    fn merge(&mut self, staged: TopicCache) {
        self.ids.extend(staged.ids);
        self.names.extend(staged.names);
        self.meta.extend(staged.meta);
    }
}

/// Writes made by one open batch. Cache changes stay staged here until the
/// batch commits.
#[derive(Default)]
struct BatchWrite {
    staged: TopicCache,
    inserted: usize,
    duplicates: usize,
    topics_created: usize,
    topics_renamed: usize,
    metadata_writes: usize,
}

impl BatchWrite {
    fn topic_id(&self, cache: &TopicCache, key: &str) -> Option<TopicId> {
        self.staged.ids.get(key).or_else(|| cache.ids.get(key)).copied()
    }

    fn display_name<'a>(&'a self, cache: &'a TopicCache, key: &str) -> Option<&'a str> {
        self.staged
            .names
            .get(key)
            .or_else(|| cache.names.get(key))
            .map(String::as_str)
    }

    fn metadata<'a>(&'a self, cache: &'a TopicCache, topic_id: TopicId) -> Option<&'a Metadata> {
        self.staged.meta.get(&topic_id).or_else(|| cache.meta.get(&topic_id))
    }

    fn resolve_topic<B: Backend>(
        &mut self,
        tx: &mut StoreTransaction<'_, B>,
        cache: &TopicCache,
        name: &str,
    ) -> Result<TopicId> {
        let key = topic_key(name);

        let Some(topic_id) = self.topic_id(cache, &key) else {
            let topic_id = tx.resolve_or_create_topic(name)?;
            self.staged.ids.insert(key.clone(), topic_id);
            self.staged.names.insert(key, name.to_string());
            self.topics_created += 1;
            return Ok(topic_id);
        };

        // most recently seen casing wins, the id never changes
        if self.display_name(cache, &key) != Some(name) {
            tx.update_topic_name(topic_id, name)?;
            self.staged.names.insert(key, name.to_string());
            self.topics_renamed += 1;
        }

        Ok(topic_id)
    }

    fn sync_metadata<B: Backend>(
        &mut self,
        tx: &mut StoreTransaction<'_, B>,
        cache: &TopicCache,
        topic_id: TopicId,
        metadata: &Metadata,
    ) -> Result<()> {
        let unchanged = match self.metadata(cache, topic_id) {
            Some(previous) => previous == metadata,
            None => metadata.is_empty(),
        };
        if unchanged {
            return Ok(());
        }

        tx.upsert_metadata(topic_id, metadata)?;
        self.staged.meta.insert(topic_id, metadata.clone());
        self.metadata_writes += 1;
        Ok(())
    }

    fn write_all<B: Backend>(
        &mut self,
        tx: &mut StoreTransaction<'_, B>,
        cache: &TopicCache,
        records: &[Record],
    ) -> Result<()> {
        for record in records {
            let topic_id = self.resolve_topic(tx, cache, &record.topic)?;
            self.sync_metadata(tx, cache, topic_id, &record.metadata)?;

            if tx.insert_data(record.timestamp, topic_id, &record.value)? {
                self.inserted += 1;
            } else {
                self.duplicates += 1;
            }
        }
        Ok(())
    }
}

/// Ingestion coordinator for one archive store.
///
/// All calls are expected from a single worker; see [`HistorianWorker`].
pub struct Historian<B: Backend = SqliteBackend> {
    store: ArchiveStore<B>,
    cache: TopicCache,
    stats: HistorianStats,
}

impl<B: Backend> Historian<B> {
    pub fn new(config: &HistorianConfig) -> Result<Self> {
        config.validate()?;
        let store = ArchiveStore::with_period(
            config.connection.params.clone(),
            config.tables_def.clone(),
            config.archive_period()?,
        )?;
        Self::with_store(store)
    }

    /// Ensures the schema and loads the topic and metadata caches.
    pub fn with_store(mut store: ArchiveStore<B>) -> Result<Self> {
        store.setup_schema()?;
        let cache = TopicCache::load(&mut store)?;

        Ok(Self {
            store,
            cache,
            stats: HistorianStats::default(),
        })
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn store(&self) -> &ArchiveStore<B> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ArchiveStore<B> {
        &mut self.store
    }

    pub fn stats(&self) -> HistorianStats {
        self.stats.clone()
    }

    pub fn cached_topic_id(&self, name: &str) -> Option<TopicId> {
        self.cache.ids.get(&topic_key(name)).copied()
    }

    pub fn cached_topic_count(&self) -> usize {
        self.cache.ids.len()
    }

    /// Writes a batch in one transaction.
    ///
    /// The batch is either committed as a whole and reported as handled, or
    /// nothing of it is visible. Records that duplicate an existing
    /// (topic, timestamp) row are skipped; a batch made only of those is not
    /// committed and is reported as not handled.
    pub fn publish_batch(&mut self, records: &[Record]) -> Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::NotHandled);
        }

        let mut tx = self.store.transaction()?;
        let mut write = BatchWrite::default();

        if let Err(err) = write.write_all(&mut tx, &self.cache, records) {
            if let Err(rollback_err) = tx.rollback() {
                log::error!("Rollback after failed batch also failed: {}", rollback_err);
            }
            self.stats.rollbacks += 1;
            log::warn!("Batch of {} records rolled back: {}", records.len(), err);
            return Err(err);
        }

        self.stats.duplicates_skipped += write.duplicates;

        if write.inserted == 0 {
            if let Err(err) = tx.rollback() {
                self.stats.rollbacks += 1;
                log::error!(
                    "Rollback of batch of {} duplicate records failed: {}",
                    records.len(),
                    err
                );
                return Err(err);
            }
            log::debug!("No new rows in batch of {} records, nothing committed", records.len());
            return Ok(BatchOutcome::NotHandled);
        }

        if let Err(err) = tx.commit() {
            self.stats.rollbacks += 1;
            log::warn!("Batch of {} records rolled back: {}", records.len(), err);
            return Err(err);
        }

        self.cache.merge(write.staged);
        self.stats.batches_committed += 1;
        self.stats.rows_inserted += write.inserted;
        self.stats.topics_created += write.topics_created;
        self.stats.topics_renamed += write.topics_renamed;
        self.stats.metadata_writes += write.metadata_writes;

        log::debug!(
            "Committed batch of {} records ({} rows inserted)",
            records.len(),
            write.inserted
        );

        Ok(BatchOutcome::Handled {
            records: records.len(),
            inserted: write.inserted,
        })
    }

    /// Periodic maintenance entry point: archives the active file when due.
    ///
    /// History and storage limits are accepted but not enforced.
    pub fn run_maintenance(
        &mut self,
        history_limit: Option<DateTime<Utc>>,
        storage_limit_gb: Option<f64>,
    ) -> Result<bool> {
        self.run_maintenance_at(Local::now(), history_limit, storage_limit_gb)
    }

    pub fn run_maintenance_at(
        &mut self,
        now: DateTime<Local>,
        history_limit: Option<DateTime<Utc>>,
        storage_limit_gb: Option<f64>,
    ) -> Result<bool> {
        if history_limit.is_some() || storage_limit_gb.is_some() {
            log::debug!(
                "Ignoring history limit {:?} and storage limit {:?} GB, only time based archiving applies",
                history_limit,
                storage_limit_gb
            );
        }

        let rotated = self.store.check_and_rotate(now)?;
        if rotated {
            // the new file starts with empty tables
            self.cache.clear();
            self.stats.rotations += 1;
        }
        Ok(rotated)
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}
