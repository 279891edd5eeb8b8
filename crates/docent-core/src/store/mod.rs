//! Nearest-neighbor store abstraction.
//!
//! The [`VectorStore`] trait is the black-box persistence layer behind the
//! [`VectorIndex`](crate::index::VectorIndex) adapter: named collections of
//! records, each holding an id, an embedding, a text body, and a flat
//! metadata map. Similarity is cosine.
//!
//! Filters are equality on a single metadata key. Range logic (neighbor
//! windows) lives in the adapter.
//!
//! Implementations must be `Send + Sync` to work with async runtimes. The
//! in-memory store lives in [`memory`]; the SQLite store lives in the app
//! crate.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default upper bound on records per `add` call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// One stored entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: Metadata,
}

/// A record returned by similarity search.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: VectorRecord,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Equality filter on one metadata key.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFilter {
    pub key: String,
    pub value: MetadataValue,
}

impl MetadataFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        metadata.get(&self.key) == Some(&self.value)
    }
}

/// Abstract nearest-neighbor store over named collections.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`collection_exists`](VectorStore::collection_exists) | Existence probe |
/// | [`create_collection`](VectorStore::create_collection) | Get-or-create |
/// | [`delete_collection`](VectorStore::delete_collection) | Drop; `false` if absent |
/// | [`count`](VectorStore::count) | Record count |
/// | [`add`](VectorStore::add) | Insert or replace records by id |
/// | [`query`](VectorStore::query) | Top-`limit` by cosine similarity |
/// | [`get_where`](VectorStore::get_where) | All records matching a filter |
/// | [`delete_where`](VectorStore::delete_where) | Delete records matching a filter |
///
/// Operations on a missing collection are errors except
/// `collection_exists` and `delete_collection`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool>;

    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Returns whether the collection existed.
    async fn delete_collection(&self, name: &str) -> Result<bool>;

    async fn count(&self, name: &str) -> Result<usize>;

    async fn add(&self, name: &str, records: Vec<VectorRecord>) -> Result<()>;

    async fn query(&self, name: &str, embedding: &[f32], limit: usize)
        -> Result<Vec<ScoredRecord>>;

    async fn get_where(&self, name: &str, filter: &MetadataFilter) -> Result<Vec<VectorRecord>>;

    /// Returns the number of records removed.
    async fn delete_where(&self, name: &str, filter: &MetadataFilter) -> Result<usize>;

    /// Largest record count a single `add` call accepts.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let mut m = Metadata::new();
        m.insert("document_id".into(), "d1".into());
        m.insert("sequence_number".into(), 3i64.into());

        assert!(MetadataFilter::eq("document_id", "d1").matches(&m));
        assert!(!MetadataFilter::eq("document_id", "d2").matches(&m));
        assert!(MetadataFilter::eq("sequence_number", 3i64).matches(&m));
        assert!(!MetadataFilter::eq("missing", "x").matches(&m));
    }

    #[test]
    fn test_metadata_json_shape() {
        let mut m = Metadata::new();
        m.insert("has_code".into(), true.into());
        m.insert("page_number".into(), 12i64.into());
        m.insert("chapter".into(), "Intro".into());
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"chapter":"Intro","has_code":true,"page_number":12}"#);
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
