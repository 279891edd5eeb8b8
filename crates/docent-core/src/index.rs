//! Vector index adapter: chunks in, ranked chunks out.
//!
//! [`VectorIndex`] sits on top of a [`VectorStore`] and speaks in
//! [`Chunk`]s. Each session owns one collection, named by a sanitized form
//! of the session id (see [`sanitize_collection_name`]).
//!
//! Neighbor expansion is done here rather than in the store: the store only
//! offers equality filters, so the adapter fetches every chunk of each
//! touched document and filters by sequence number itself.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::Chunk;
use crate::store::{Metadata, MetadataFilter, MetadataValue, VectorRecord, VectorStore};

const SERVICE: &str = "vector index";
const MAX_NAME_LEN: usize = 63;
const MIN_NAME_LEN: usize = 3;

const KEY_DOCUMENT_ID: &str = "document_id";
const KEY_SEQUENCE: &str = "sequence_number";
const KEY_PAGE: &str = "page_number";
const KEY_CHAPTER: &str = "chapter";
const KEY_HAS_CODE: &str = "has_code";
const KEY_CODE_LANGUAGE: &str = "code_language";
const KEY_PARENT_ID: &str = "parent_chunk_id";
const KEY_PARENT_CONTENT: &str = "parent_content";

/// Derives a store-safe collection name from a session id.
///
/// Deterministic, so the same session always maps to the same collection.
/// The result is 3 to 63 characters of `[A-Za-z0-9_-]`, starts with a
/// letter, and does not end with a separator.
///
/// ```rust
/// use docent_core::index::sanitize_collection_name;
///
/// assert_eq!(sanitize_collection_name("my session"), "my_session");
/// assert_eq!(sanitize_collection_name("42"), "c_42");
/// ```
pub fn sanitize_collection_name(id: &str) -> String {
    let mut name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert_str(0, "c_");
    }
    name.truncate(MAX_NAME_LEN);

    // Strip before padding so the pad cannot leave a short name behind.
    let mut name = name.trim_end_matches(['-', '_']).to_string();
    if name.len() < MIN_NAME_LEN {
        name.push_str("_col");
    }
    name
}

/// Chunk-level operations over per-session collections.
#[derive(Clone)]
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Persists embedded chunks, creating the collection on first use.
    ///
    /// Every chunk must carry an embedding. Inserts are split to respect
    /// the store's batch limit.
    pub async fn add_chunks(&self, chunks: &[Chunk], collection_id: &str) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let records = chunks
            .iter()
            .map(chunk_to_record)
            .collect::<Result<Vec<_>>>()?;

        let name = sanitize_collection_name(collection_id);
        self.store
            .create_collection(&name)
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))?;

        let batch_size = self.store.max_batch_size().max(1);
        for batch in records.chunks(batch_size) {
            self.store
                .add(&name, batch.to_vec())
                .await
                .map_err(|e| Error::unavailable(SERVICE, e))?;
        }

        info!(collection = %name, added = chunks.len(), "Stored chunks");
        Ok(())
    }

    /// Returns up to `top_k` chunks ranked by similarity.
    ///
    /// A missing collection is an empty result, not an error.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        collection_id: &str,
        top_k: usize,
    ) -> Result<Vec<Chunk>> {
        let name = sanitize_collection_name(collection_id);
        if !self.exists(&name).await? {
            return Ok(Vec::new());
        }

        let hits = self
            .store
            .query(&name, query_embedding, top_k)
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))?;

        debug!(collection = %name, top_k, hits = hits.len(), "Vector search");
        Ok(hits.into_iter().map(|h| record_to_chunk(h.record)).collect())
    }

    /// Expands `chunks` with their sequence neighbors.
    ///
    /// For each input chunk, every chunk of the same document whose
    /// sequence number is within `window` is added. The inputs are always
    /// kept. The result is deduplicated by id and sorted by
    /// `(document_id, sequence_number)`.
    pub async fn get_neighbor_chunks(
        &self,
        chunks: &[Chunk],
        collection_id: &str,
        window: usize,
    ) -> Result<Vec<Chunk>> {
        if window == 0 || chunks.is_empty() {
            return Ok(chunks.to_vec());
        }
        let name = sanitize_collection_name(collection_id);
        if !self.exists(&name).await? {
            return Ok(chunks.to_vec());
        }

        let window = u32::try_from(window).unwrap_or(u32::MAX);
        let mut wanted: BTreeMap<&str, Vec<(u32, u32)>> = BTreeMap::new();
        for chunk in chunks {
            let low = chunk.sequence_number.saturating_sub(window);
            let high = chunk.sequence_number.saturating_add(window);
            wanted
                .entry(chunk.document_id.as_str())
                .or_default()
                .push((low, high));
        }

        let fetches = wanted.keys().map(|document_id| {
            let name = name.as_str();
            async move {
                let filter = MetadataFilter::eq(KEY_DOCUMENT_ID, *document_id);
                self.store.get_where(name, &filter).await
            }
        });
        let fetched = try_join_all(fetches)
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut expanded: Vec<Chunk> = Vec::new();
        for chunk in chunks {
            if seen.insert(chunk.id.clone()) {
                expanded.push(chunk.clone());
            }
        }
        for (ranges, records) in wanted.values().zip(fetched) {
            for record in records {
                let candidate = record_to_chunk(record);
                let seq = candidate.sequence_number;
                let in_window = ranges.iter().any(|&(lo, hi)| lo <= seq && seq <= hi);
                if in_window && seen.insert(candidate.id.clone()) {
                    expanded.push(candidate);
                }
            }
        }

        expanded.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });

        debug!(
            collection = %name,
            window,
            input = chunks.len(),
            expanded = expanded.len(),
            "Neighbor expansion"
        );
        Ok(expanded)
    }

    /// All chunks of one document, in sequence order.
    pub async fn get_document_chunks(
        &self,
        collection_id: &str,
        document_id: &str,
    ) -> Result<Vec<Chunk>> {
        let name = sanitize_collection_name(collection_id);
        if !self.exists(&name).await? {
            return Ok(Vec::new());
        }
        let records = self
            .store
            .get_where(&name, &MetadataFilter::eq(KEY_DOCUMENT_ID, document_id))
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))?;

        let mut chunks: Vec<Chunk> = records.into_iter().map(record_to_chunk).collect();
        chunks.sort_by_key(|c| c.sequence_number);
        Ok(chunks)
    }

    /// Number of chunks in the collection; 0 if it does not exist.
    pub async fn get_collection_size(&self, collection_id: &str) -> Result<usize> {
        let name = sanitize_collection_name(collection_id);
        if !self.exists(&name).await? {
            return Ok(0);
        }
        self.store
            .count(&name)
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))
    }

    pub async fn collection_exists(&self, collection_id: &str) -> Result<bool> {
        self.exists(&sanitize_collection_name(collection_id)).await
    }

    /// Drops the collection. Returns whether it existed.
    pub async fn delete_collection(&self, collection_id: &str) -> Result<bool> {
        let name = sanitize_collection_name(collection_id);
        let existed = self
            .store
            .delete_collection(&name)
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))?;
        if existed {
            info!(collection = %name, "Deleted collection");
        }
        Ok(existed)
    }

    /// Removes one document's chunks. Returns how many were removed.
    pub async fn delete_book_chunks(&self, collection_id: &str, document_id: &str) -> Result<usize> {
        let name = sanitize_collection_name(collection_id);
        if !self.exists(&name).await? {
            return Ok(0);
        }
        let removed = self
            .store
            .delete_where(&name, &MetadataFilter::eq(KEY_DOCUMENT_ID, document_id))
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))?;
        info!(collection = %name, document_id, removed, "Deleted document chunks");
        Ok(removed)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        self.store
            .collection_exists(name)
            .await
            .map_err(|e| Error::unavailable(SERVICE, e))
    }
}

fn chunk_to_record(chunk: &Chunk) -> Result<VectorRecord> {
    let embedding = chunk
        .embedding
        .clone()
        .ok_or_else(|| Error::MissingEmbedding {
            chunk_id: chunk.id.clone(),
        })?;

    let mut metadata = Metadata::new();
    metadata.insert(KEY_DOCUMENT_ID.into(), chunk.document_id.clone().into());
    metadata.insert(KEY_SEQUENCE.into(), i64::from(chunk.sequence_number).into());
    metadata.insert(KEY_HAS_CODE.into(), chunk.has_code.into());
    if let Some(page) = chunk.page_number {
        metadata.insert(KEY_PAGE.into(), i64::from(page).into());
    }
    let optional = [
        (KEY_CHAPTER, &chunk.chapter),
        (KEY_CODE_LANGUAGE, &chunk.code_language),
        (KEY_PARENT_ID, &chunk.parent_chunk_id),
        (KEY_PARENT_CONTENT, &chunk.parent_content),
    ];
    for (key, value) in optional {
        if let Some(v) = value {
            metadata.insert(key.into(), v.clone().into());
        }
    }

    Ok(VectorRecord {
        id: chunk.id.clone(),
        embedding,
        document: chunk.content.clone(),
        metadata,
    })
}

fn record_to_chunk(record: VectorRecord) -> Chunk {
    let meta = &record.metadata;
    let string = |key: &str| meta.get(key).and_then(MetadataValue::as_str).map(String::from);
    let number = |key: &str| {
        meta.get(key)
            .and_then(MetadataValue::as_int)
            .and_then(|v| u32::try_from(v).ok())
    };

    Chunk {
        document_id: string(KEY_DOCUMENT_ID).unwrap_or_default(),
        sequence_number: number(KEY_SEQUENCE).unwrap_or(0),
        page_number: number(KEY_PAGE),
        chapter: string(KEY_CHAPTER),
        has_code: meta
            .get(KEY_HAS_CODE)
            .and_then(MetadataValue::as_bool)
            .unwrap_or(false),
        code_language: string(KEY_CODE_LANGUAGE),
        parent_chunk_id: string(KEY_PARENT_ID),
        parent_content: string(KEY_PARENT_CONTENT),
        embedding: Some(record.embedding),
        content: record.document,
        id: record.id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryVectorStore;

    fn chunk(id: &str, doc: &str, seq: u32, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: doc.into(),
            content: format!("content {id}"),
            page_number: Some(seq + 1),
            chapter: Some("Ch".into()),
            has_code: seq == 2,
            code_language: (seq == 2).then(|| "rust".to_string()),
            sequence_number: seq,
            parent_chunk_id: Some(format!("p{}", seq / 3)),
            parent_content: Some(format!("parent {}", seq / 3)),
            embedding: Some(embedding),
        }
    }

    /// Ten chunks of document `d1`, chunk `i` pointing mostly along axis `i`.
    fn corpus() -> Vec<Chunk> {
        (0..10)
            .map(|i| {
                let mut e = vec![0.01; 10];
                e[i] = 1.0;
                chunk(&format!("d1-{i}"), "d1", i as u32, e)
            })
            .collect()
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut e = vec![0.0; 10];
        e[i] = 1.0;
        e
    }

    async fn index_with(chunks: &[Chunk]) -> VectorIndex {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()));
        index.add_chunks(chunks, "session-1").await.unwrap();
        index
    }

    #[test]
    fn test_sanitize_collection_name() {
        assert_eq!(sanitize_collection_name("abc-123_x"), "abc-123_x");
        assert_eq!(sanitize_collection_name("my session!"), "my_session");
        assert_eq!(sanitize_collection_name("123"), "c_123");
        assert_eq!(sanitize_collection_name("_x"), "c__x");
        assert_eq!(sanitize_collection_name("a"), "a_col");
        assert_eq!(sanitize_collection_name(""), "c_col");
        assert_eq!(sanitize_collection_name("ab-"), "ab_col");
        assert_eq!(sanitize_collection_name("-"), "c_col");

        let long = "s".repeat(100);
        assert_eq!(sanitize_collection_name(&long).len(), 63);

        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(sanitize_collection_name(uuid), format!("c_{uuid}"));
    }

    #[test]
    fn test_sanitize_is_stable_and_bounded() {
        for id in ["", "-", "é", "a b c", "__", "9", &"x-".repeat(40)] {
            let name = sanitize_collection_name(id);
            assert_eq!(name, sanitize_collection_name(id));
            assert!((3..=63).contains(&name.len()), "{id:?} -> {name:?}");
            assert!(name.starts_with(|c: char| c.is_ascii_alphabetic()));
            assert!(!name.ends_with(['-', '_']));
        }
    }

    #[test]
    fn test_record_roundtrip_keeps_metadata() {
        let c = chunk("x", "d", 2, vec![1.0, 2.0]);
        let back = record_to_chunk(chunk_to_record(&c).unwrap());
        assert_eq!(back, c);

        let mut bare = chunk("y", "d", 4, vec![1.0]);
        bare.page_number = None;
        bare.chapter = None;
        bare.parent_chunk_id = None;
        bare.parent_content = None;
        assert_eq!(record_to_chunk(chunk_to_record(&bare).unwrap()), bare);
    }

    #[tokio::test]
    async fn test_add_requires_embedding() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()));
        let mut c = chunk("x", "d", 0, vec![1.0]);
        c.embedding = None;
        let err = index.add_chunks(&[c], "s").await.unwrap_err();
        assert!(matches!(err, Error::MissingEmbedding { .. }));
        assert!(!index.collection_exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_empty_is_noop() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()));
        index.add_chunks(&[], "s").await.unwrap();
        assert!(!index.collection_exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_batches_under_store_limit() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::with_max_batch_size(3)));
        index.add_chunks(&corpus(), "s").await.unwrap();
        assert_eq!(index.get_collection_size("s").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_search_missing_collection_is_empty() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()));
        assert!(index.search(&axis(0), "nope", 5).await.unwrap().is_empty());
        assert_eq!(index.get_collection_size("nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let index = index_with(&corpus()).await;
        let hits = index.search(&axis(4), "session-1", 3).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].id, "d1-4");
        assert_eq!(hits[0].sequence_number, 4);
        assert_eq!(hits[0].parent_chunk_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_neighbors_window_zero_is_identity() {
        let index = index_with(&corpus()).await;
        let hits = index.search(&axis(4), "session-1", 2).await.unwrap();
        let same = index.get_neighbor_chunks(&hits, "session-1", 0).await.unwrap();
        assert_eq!(same, hits);
    }

    #[tokio::test]
    async fn test_neighbors_expand_and_sort() {
        let index = index_with(&corpus()).await;
        let hits = index.search(&axis(4), "session-1", 1).await.unwrap();
        let expanded = index.get_neighbor_chunks(&hits, "session-1", 1).await.unwrap();
        let seqs: Vec<u32> = expanded.iter().map(|c| c.sequence_number).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_neighbors_clamp_and_dedup() {
        let index = index_with(&corpus()).await;
        let corpus = corpus();
        let inputs = vec![corpus[0].clone(), corpus[1].clone(), corpus[9].clone()];
        let expanded = index.get_neighbor_chunks(&inputs, "session-1", 2).await.unwrap();
        let seqs: Vec<u32> = expanded.iter().map(|c| c.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 7, 8, 9]);

        let ids: HashSet<&str> = expanded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), expanded.len());
        for input in &inputs {
            assert!(ids.contains(input.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_neighbors_stay_within_document() {
        let mut chunks = corpus();
        chunks.extend((0..3).map(|i| chunk(&format!("d2-{i}"), "d2", i, axis(i as usize))));
        let index = index_with(&chunks).await;

        let input = vec![chunks[11].clone()];
        let expanded = index.get_neighbor_chunks(&input, "session-1", 1).await.unwrap();
        assert!(expanded.iter().all(|c| c.document_id == "d2"));
        assert_eq!(expanded.len(), 3);
    }

    #[tokio::test]
    async fn test_neighbors_missing_collection_returns_input() {
        let index = VectorIndex::new(Arc::new(InMemoryVectorStore::new()));
        let input = vec![chunk("x", "d", 3, vec![1.0])];
        assert_eq!(
            index.get_neighbor_chunks(&input, "gone", 2).await.unwrap(),
            input
        );
    }

    #[tokio::test]
    async fn test_document_chunks_and_deletion() {
        let mut chunks = corpus();
        chunks.push(chunk("d2-0", "d2", 0, axis(0)));
        let index = index_with(&chunks).await;

        let doc = index.get_document_chunks("session-1", "d1").await.unwrap();
        assert_eq!(doc.len(), 10);
        assert!(doc.windows(2).all(|w| w[0].sequence_number < w[1].sequence_number));

        assert_eq!(index.delete_book_chunks("session-1", "d1").await.unwrap(), 10);
        assert_eq!(index.delete_book_chunks("session-1", "d1").await.unwrap(), 0);
        assert_eq!(index.get_collection_size("session-1").await.unwrap(), 1);

        assert!(index.delete_collection("session-1").await.unwrap());
        assert!(!index.delete_collection("session-1").await.unwrap());
        assert_eq!(index.delete_book_chunks("session-1", "d2").await.unwrap(), 0);
    }
}
