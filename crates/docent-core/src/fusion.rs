//! Retrieval sizing and context fusion.
//!
//! Pure functions: no I/O, no async. The query service calls them between
//! retrieval and generation.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::Chunk;

/// Floor and default for percentage-based retrieval.
pub const MIN_TOP_K: usize = 5;
/// Ceiling for percentage-based retrieval.
pub const MAX_TOP_K: usize = 100;
/// Accepted range for `retrieval_percentage`.
pub const PERCENTAGE_RANGE: std::ops::RangeInclusive<f64> = 0.5..=10.0;

/// `clamp(round(size * percentage / 100), 5, 100)`; 5 for an empty collection.
///
/// ```rust
/// use docent_core::fusion::adaptive_top_k;
///
/// assert_eq!(adaptive_top_k(0, 1.0), 5);
/// assert_eq!(adaptive_top_k(1000, 1.0), 10);
/// assert_eq!(adaptive_top_k(10_000, 10.0), 100);
/// ```
pub fn adaptive_top_k(collection_size: usize, percentage: f64) -> usize {
    if collection_size == 0 {
        return MIN_TOP_K;
    }
    let raw = (collection_size as f64 * percentage / 100.0).round();
    (raw as usize).clamp(MIN_TOP_K, MAX_TOP_K)
}

/// Picks the effective `top_k` for a request.
///
/// A percentage wins over a literal count; with neither, `default_top_k`
/// applies.
pub fn resolve_top_k(
    top_k: Option<usize>,
    retrieval_percentage: Option<f64>,
    collection_size: usize,
    default_top_k: usize,
) -> Result<usize> {
    if let Some(p) = retrieval_percentage {
        if !PERCENTAGE_RANGE.contains(&p) {
            return Err(Error::InvalidRequest(format!(
                "retrieval_percentage must be between {} and {}, got {}",
                PERCENTAGE_RANGE.start(),
                PERCENTAGE_RANGE.end(),
                p
            )));
        }
        return Ok(adaptive_top_k(collection_size, p));
    }
    match top_k {
        Some(0) => Err(Error::InvalidRequest("top_k must be at least 1".into())),
        Some(k) => Ok(k),
        None => Ok(default_top_k),
    }
}

/// Swaps each chunk's text for its parent window text, then drops siblings.
///
/// After substitution, chunks under one parent carry the same text, so only
/// the first chunk per `parent_chunk_id` is kept. Chunks without a parent
/// pass through untouched. Order is preserved.
pub fn substitute_parent_content(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut seen_parents: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(chunks.len());

    for mut chunk in chunks {
        if let Some(parent_id) = &chunk.parent_chunk_id {
            if !seen_parents.insert(parent_id.clone()) {
                continue;
            }
        }
        if let Some(parent) = chunk.parent_content.clone() {
            chunk.content = parent;
        }
        out.push(chunk);
    }
    out
}

/// What the generator receives as grounding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
pub enum ContextPayload {
    /// Local chunks only, with their metadata.
    Chunks(Vec<Chunk>),
    /// Pre-rendered context strings.
    Texts(Vec<String>),
}

impl ContextPayload {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        match self {
            ContextPayload::Chunks(c) => c.len(),
            ContextPayload::Texts(t) => t.len(),
        }
    }
}

impl Default for ContextPayload {
    fn default() -> Self {
        ContextPayload::Chunks(Vec::new())
    }
}

/// Combines local chunks and external context into one payload.
///
/// | Local | External | Result |
/// |-------|----------|--------|
/// | yes | no | `Chunks(local)` |
/// | no | yes | `Texts(external)` |
/// | yes | yes | `Texts(external ++ local rendered with attribution)` |
/// | no | no | `Chunks([])` |
pub fn fuse_context(local: Vec<Chunk>, external: Vec<String>) -> ContextPayload {
    match (local.is_empty(), external.is_empty()) {
        (_, true) => ContextPayload::Chunks(local),
        (true, false) => ContextPayload::Texts(external),
        (false, false) => {
            let mut texts = external;
            texts.extend(local.iter().map(render_with_attribution));
            ContextPayload::Texts(texts)
        }
    }
}

fn render_with_attribution(chunk: &Chunk) -> String {
    match chunk.attribution() {
        Some(attribution) => format!("{} [{}]", chunk.content, attribution),
        None => chunk.content.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, parent: Option<&str>, chapter: Option<&str>, page: Option<u32>) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: "d".into(),
            content: format!("child {id}"),
            page_number: page,
            chapter: chapter.map(String::from),
            has_code: false,
            code_language: None,
            sequence_number: 0,
            parent_chunk_id: parent.map(String::from),
            parent_content: parent.map(|p| format!("parent {p}")),
            embedding: None,
        }
    }

    #[test]
    fn test_adaptive_top_k_values() {
        assert_eq!(adaptive_top_k(0, 5.0), 5);
        assert_eq!(adaptive_top_k(1000, 1.0), 10);
        assert_eq!(adaptive_top_k(10, 10.0), 5);
        assert_eq!(adaptive_top_k(10_000, 10.0), 100);
        assert_eq!(adaptive_top_k(1000, 2.5), 25);
        assert_eq!(adaptive_top_k(130, 5.0), 7);
    }

    #[test]
    fn test_adaptive_top_k_bounds() {
        for size in [0, 1, 7, 99, 500, 1234, 100_000] {
            for p in [0.5, 1.0, 3.3, 10.0] {
                let k = adaptive_top_k(size, p);
                assert!((MIN_TOP_K..=MAX_TOP_K).contains(&k), "{size} {p} -> {k}");
            }
        }
    }

    #[test]
    fn test_resolve_top_k() {
        assert_eq!(resolve_top_k(None, None, 100, 5).unwrap(), 5);
        assert_eq!(resolve_top_k(Some(12), None, 100, 5).unwrap(), 12);
        assert_eq!(resolve_top_k(Some(12), Some(10.0), 1000, 5).unwrap(), 100);
        assert!(matches!(
            resolve_top_k(Some(0), None, 100, 5),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            resolve_top_k(None, Some(0.1), 100, 5),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            resolve_top_k(None, Some(10.5), 100, 5),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_substitute_parent_content() {
        let chunks = vec![
            chunk("a", Some("p1"), None, None),
            chunk("b", Some("p1"), None, None),
            chunk("c", None, None, None),
            chunk("d", Some("p2"), None, None),
        ];
        let out = substitute_parent_content(chunks);
        let ids: Vec<&str> = out.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
        assert_eq!(out[0].content, "parent p1");
        assert_eq!(out[1].content, "child c");
        assert_eq!(out[2].content, "parent p2");
        assert_eq!(out[0].parent_chunk_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_fuse_local_only() {
        let local = vec![chunk("a", None, Some("Intro"), Some(2))];
        assert_eq!(
            fuse_context(local.clone(), vec![]),
            ContextPayload::Chunks(local)
        );
    }

    #[test]
    fn test_fuse_external_only() {
        let ext = vec!["[Compliance Control: AC-1]".to_string()];
        assert_eq!(
            fuse_context(vec![], ext.clone()),
            ContextPayload::Texts(ext)
        );
    }

    #[test]
    fn test_fuse_both_orders_external_first() {
        let local = vec![
            chunk("a", None, Some("Intro"), Some(2)),
            chunk("b", None, None, None),
        ];
        let ext = vec!["E1".to_string(), "E2".to_string()];
        let fused = fuse_context(local, ext);
        assert_eq!(
            fused,
            ContextPayload::Texts(vec![
                "E1".into(),
                "E2".into(),
                "child a [Chapter: Intro, Page 2]".into(),
                "child b".into(),
            ])
        );
    }

    #[test]
    fn test_fuse_neither() {
        let fused = fuse_context(vec![], vec![]);
        assert!(fused.is_empty());
        assert_eq!(fused, ContextPayload::Chunks(vec![]));
    }
}
