use std::{collections::HashMap, sync::Arc};

use notebook_core::{ServerKey, ServerRecord};
use tokio::sync::RwLock;

use crate::store::{InsertOutcome, ServerStore, StoreError};

#[derive(Default)]
struct Entries {
    records: HashMap<ServerKey, ServerRecord>,
    /// Bumped on every delete. An unlocked fill that started before a delete
    /// must not write the record back.
    deletes: u64,
}

/// Cache-aside layer in front of a [`ServerStore`].
///
/// The store stays authoritative. Only presences are cached; a miss always
/// goes to the store. [`get`](Self::get), inserts and deletes are expected to
/// run under the caller's per-key lock; [`get_cached`](Self::get_cached) is not.
pub struct CachedStore {
    inner: Arc<dyn ServerStore>,
    cache: RwLock<Entries>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn ServerStore>) -> Self {
        Self {
            inner,
            cache: RwLock::new(Entries::default()),
        }
    }

    /// Serves from the cache, filling it on miss. May be stale while a stop is
    /// in flight, never after it has completed.
    pub async fn get_cached(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError> {
        let deletes_seen = {
            let cache = self.cache.read().await;
            if let Some(hit) = cache.records.get(key) {
                return Ok(Some(hit.clone()));
            }
            cache.deletes
        };

        let found = self.inner.get(key).await?;
        if let Some(record) = &found {
            let mut cache = self.cache.write().await;
            if cache.deletes == deletes_seen {
                cache.records.insert(key.clone(), record.clone());
            }
        }
        Ok(found)
    }

    /// Reads through to the store and brings the cache in line with it.
    pub async fn get(&self, key: &ServerKey) -> Result<Option<ServerRecord>, StoreError> {
        let found = self.inner.get(key).await?;
        let mut cache = self.cache.write().await;
        match &found {
            Some(record) => {
                cache.records.insert(key.clone(), record.clone());
            }
            None => {
                cache.records.remove(key);
            }
        }
        Ok(found)
    }

    pub async fn list_project(&self, project: &str) -> Result<Vec<ServerRecord>, StoreError> {
        self.inner.list_project(project).await
    }

    pub async fn insert_if_absent(&self, record: &ServerRecord) -> Result<InsertOutcome, StoreError> {
        let outcome = self.inner.insert_if_absent(record).await?;
        let stored = match &outcome {
            InsertOutcome::Inserted => record,
            InsertOutcome::Existing(existing) => existing,
        };
        self.cache
            .write()
            .await
            .records
            .insert(stored.key(), stored.clone());
        Ok(outcome)
    }

    pub async fn delete(&self, key: &ServerKey) -> Result<bool, StoreError> {
        self.invalidate(key).await;
        let res = self.inner.delete(key).await;
        // Again after the store write: a fill racing the delete may have
        // landed in between.
        self.invalidate(key).await;
        res
    }

    async fn invalidate(&self, key: &ServerKey) {
        let mut cache = self.cache.write().await;
        cache.records.remove(key);
        cache.deletes = cache.deletes.wrapping_add(1);
    }
}
