use chrono::{DateTime, Utc};

use super::backend::Backend;
use super::store::{ArchiveStore, Metadata, TopicId};
use super::{Error, Result};

/// An open transaction on the active storage file.
///
/// The store is mutably borrowed for the guard's lifetime, so no rotation can
/// happen while it is open. Dropping the guard without `commit` rolls back.
pub struct StoreTransaction<'a, B: Backend> {
    store: &'a mut ArchiveStore<B>,
    finished: bool,
}

impl<'a, B: Backend> StoreTransaction<'a, B> {
    pub(super) fn begin(store: &'a mut ArchiveStore<B>) -> Result<Self> {
        store.backend()?.execute_batch("BEGIN")?;
        Ok(Self {
            store,
            finished: false,
        })
    }

    pub fn resolve_or_create_topic(&mut self, name: &str) -> Result<TopicId> {
        self.store.resolve_or_create_topic(name)
    }

    pub fn update_topic_name(&mut self, topic_id: TopicId, display_name: &str) -> Result<()> {
        self.store.update_topic_name(topic_id, display_name)
    }

    pub fn upsert_metadata(&mut self, topic_id: TopicId, metadata: &Metadata) -> Result<()> {
        self.store.upsert_metadata(topic_id, metadata)
    }

    pub fn insert_data(
        &mut self,
        ts: DateTime<Utc>,
        topic_id: TopicId,
        value: &serde_json::Value,
    ) -> Result<bool> {
        self.store.insert_data(ts, topic_id, value)
    }

    /// On failure the transaction is rolled back before `TransactionFailure`
    /// is returned.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let committed = self.store.backend().and_then(|b| b.execute_batch("COMMIT"));
        if let Err(err) = committed {
            self.rollback_quietly();
            return Err(Error::TransactionFailure(err.to_string()));
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.store.backend()?.execute_batch("ROLLBACK")
    }

    fn rollback_quietly(&mut self) {
        let rolled_back = self.store.backend().and_then(|b| b.execute_batch("ROLLBACK"));
        if let Err(err) = rolled_back {
            log::error!("Rollback failed: {}", err);
        }
    }
}

impl<B: Backend> Drop for StoreTransaction<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            log::warn!("Transaction dropped without commit, rolling back");
            self.rollback_quietly();
        }
    }
}
