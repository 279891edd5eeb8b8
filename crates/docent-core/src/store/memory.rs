//! In-memory [`VectorStore`] implementation for tests and ephemeral runs.
//!
//! Collections are `Vec`s of records behind a `std::sync::RwLock`. Vector
//! search is brute-force cosine similarity over every record in the
//! collection.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;

use super::{MetadataFilter, ScoredRecord, VectorRecord, VectorStore, DEFAULT_MAX_BATCH_SIZE};

type Collections = HashMap<String, Vec<VectorRecord>>;

/// In-memory store. Nothing survives the process.
pub struct InMemoryVectorStore {
    collections: RwLock<Collections>,
    max_batch_size: usize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    /// Lowers the per-call record limit, mostly to exercise batching.
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            max_batch_size: max_batch_size.max(1),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.collections
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(name: &str) -> anyhow::Error {
    anyhow!("collection '{}' does not exist", name)
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(name))
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.write()?.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<bool> {
        Ok(self.write()?.remove(name).is_some())
    }

    async fn count(&self, name: &str) -> Result<usize> {
        let collections = self.read()?;
        let records = collections.get(name).ok_or_else(|| missing(name))?;
        Ok(records.len())
    }

    async fn add(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.len() > self.max_batch_size {
            bail!(
                "batch of {} records exceeds store limit of {}",
                records.len(),
                self.max_batch_size
            );
        }
        let mut collections = self.write()?;
        let stored = collections.get_mut(name).ok_or_else(|| missing(name))?;
        for record in records {
            match stored.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => stored.push(record),
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let collections = self.read()?;
        let stored = collections.get(name).ok_or_else(|| missing(name))?;

        let mut scored: Vec<ScoredRecord> = stored
            .iter()
            .map(|r| ScoredRecord {
                score: cosine_similarity(embedding, &r.embedding),
                record: r.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_where(&self, name: &str, filter: &MetadataFilter) -> Result<Vec<VectorRecord>> {
        let collections = self.read()?;
        let stored = collections.get(name).ok_or_else(|| missing(name))?;
        Ok(stored
            .iter()
            .filter(|r| filter.matches(&r.metadata))
            .cloned()
            .collect())
    }

    async fn delete_where(&self, name: &str, filter: &MetadataFilter) -> Result<usize> {
        let mut collections = self.write()?;
        let stored = collections.get_mut(name).ok_or_else(|| missing(name))?;
        let before = stored.len();
        stored.retain(|r| !filter.matches(&r.metadata));
        Ok(before - stored.len())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
