//! Code-aware sliding-window chunker with parent/child grouping.
//!
//! Splits document text into overlapping child chunks small enough to embed
//! precisely, then groups consecutive children into parent windows whose
//! combined text is handed to the generator instead of the child text.
//!
//! # Algorithm
//!
//! 1. Detect code regions (fenced ```` ``` ```` blocks and reStructuredText
//!    literal blocks) as byte spans.
//! 2. Text that fits in one window becomes a single chunk.
//! 3. Otherwise slide a `chunk_size` window. A boundary that lands inside a
//!    code span extends to the span's end (if the chunk stays within 1.5×
//!    `chunk_size`) or retracts to its start. Outside code, the boundary
//!    moves back to the last sentence end found in the trailing 20% of the
//!    window.
//! 4. The next window starts `chunk_overlap` bytes before the previous end.
//!
//! ```text
//! |------ window 0 ------|
//!                   |------ window 1 ------|
//!                   ^ overlap
//! ```
//!
//! Sizes are byte counts; every cut is snapped to a UTF-8 character boundary.
//!
//! # Example
//!
//! ```rust
//! use docent_core::chunk::{ChunkMetadata, Chunker, ChunkerConfig};
//!
//! let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
//! let pieces = chunker.chunk_hierarchical("Hello world.", &ChunkMetadata::default(), 0);
//! assert_eq!(pieces.len(), 1);
//! assert_eq!(pieces[0].metadata.sequence_number, Some(0));
//! ```

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Chunk;

/// Sentence terminators searched for near a window boundary.
const SENTENCE_ENDS: [&str; 4] = [". ", ".\n", "? ", "! "];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub children_per_parent: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            children_per_parent: 3,
        }
    }
}

/// Provenance and hierarchy fields attached to a piece.
///
/// Callers pass page and chapter in; the chunker fills in the code flags
/// and, for hierarchical chunking, the sequence and parent fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkMetadata {
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
    pub has_code: bool,
    pub code_language: Option<String>,
    pub sequence_number: Option<u32>,
    pub parent_chunk_id: Option<String>,
    pub parent_content: Option<String>,
}

/// One emitted chunk, before it is bound to a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    /// Trimmed window text.
    pub text: String,
    /// Window start in the stripped input, in bytes.
    pub start: usize,
    /// Window end (exclusive) in the stripped input, in bytes.
    pub end: usize,
    pub metadata: ChunkMetadata,
}

impl ChunkPiece {
    /// Binds the piece to `document_id` under a fresh UUID.
    pub fn into_chunk(self, document_id: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            content: self.text,
            page_number: self.metadata.page_number,
            chapter: self.metadata.chapter,
            has_code: self.metadata.has_code,
            code_language: self.metadata.code_language,
            sequence_number: self.metadata.sequence_number.unwrap_or(0),
            parent_chunk_id: self.metadata.parent_chunk_id,
            parent_content: self.metadata.parent_content,
            embedding: None,
        }
    }
}

/// A detected code region, `[start, end)` in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSpan {
    pub start: usize,
    pub end: usize,
    pub language: Option<String>,
}

impl CodeSpan {
    fn strictly_contains(&self, offset: usize) -> bool {
        self.start < offset && offset < self.end
    }

    fn intersects(&self, start: usize, end: usize) -> bool {
        self.start < end && self.end > start
    }
}

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(\w*)\n(.*?)\n```").expect("valid regex"))
}

fn literal_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?:\.\. code-block::[ \t]*(\w*)|.*::)[ \t]*\n\n(?:[ \t]+[^\n]*\n|\n)*[ \t]+[^\n]*")
            .expect("valid regex")
    })
}

/// Finds fenced and reStructuredText code blocks, sorted by start offset.
pub fn detect_code_spans(text: &str) -> Vec<CodeSpan> {
    let mut spans = Vec::new();

    for caps in fenced_block_re().captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        spans.push(CodeSpan {
            start: m.start(),
            end: m.end(),
            language: non_empty(caps.get(1).map(|g| g.as_str())),
        });
    }

    for caps in literal_block_re().captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        if spans.iter().any(|s| s.intersects(m.start(), m.end())) {
            continue;
        }
        spans.push(CodeSpan {
            start: m.start(),
            end: m.end(),
            language: non_empty(caps.get(1).map(|g| g.as_str())),
        });
    }

    spans.sort_by_key(|s| s.start);
    spans
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.is_empty()).map(str::to_string)
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                config.chunk_overlap, config.chunk_size
            )));
        }
        if config.children_per_parent == 0 {
            return Err(Error::InvalidConfig(
                "children_per_parent must be > 0".into(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Splits `text` into overlapping child pieces.
    ///
    /// Returns an empty list for empty or whitespace-only input. Offsets in
    /// the returned pieces refer to `text.trim()`.
    pub fn chunk(&self, text: &str, metadata: &ChunkMetadata) -> Vec<ChunkPiece> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        let spans = detect_code_spans(text);

        if text.len() <= self.config.chunk_size {
            return vec![make_piece(text, 0, text.len(), &spans, metadata)];
        }

        let mut pieces = Vec::new();
        let mut start = 0;
        while start < text.len() {
            let end = self.window_end(text, start, &spans);
            if !text[start..end].trim().is_empty() {
                pieces.push(make_piece(text, start, end, &spans, metadata));
            }
            if end >= text.len() {
                break;
            }
            start = self.next_start(text, start, end, &spans);
        }
        pieces
    }

    /// Chunks `text`, then groups the children into parent windows.
    ///
    /// Sequence numbers start at `first_sequence` so a caller chunking a
    /// document segment by segment can keep them monotonic across the whole
    /// document. Parent groups never span two calls.
    pub fn chunk_hierarchical(
        &self,
        text: &str,
        metadata: &ChunkMetadata,
        first_sequence: u32,
    ) -> Vec<ChunkPiece> {
        let mut children = self.chunk(text, metadata);
        let group_size = self.config.children_per_parent;

        for (group_index, group) in children.chunks_mut(group_size).enumerate() {
            let parent_id = Uuid::new_v4().to_string();
            let parent_content = group
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            for (offset, child) in group.iter_mut().enumerate() {
                let position = group_index * group_size + offset;
                child.metadata.sequence_number = Some(first_sequence + position as u32);
                child.metadata.parent_chunk_id = Some(parent_id.clone());
                child.metadata.parent_content = Some(parent_content.clone());
            }
        }

        children
    }

    fn window_end(&self, text: &str, start: usize, spans: &[CodeSpan]) -> usize {
        let size = self.config.chunk_size;
        if start + size >= text.len() {
            return text.len();
        }

        let mut raw = snap_to_char_boundary(text, start + size);
        if raw <= start {
            raw = next_char_boundary(text, start);
        }

        if let Some(span) = spans.iter().find(|s| s.strictly_contains(raw)) {
            if span.end - start <= size + size / 2 {
                return span.end;
            }
            if span.start > start {
                return span.start;
            }
            // Oversized block starting at the window start: split it.
            return raw;
        }

        self.sentence_break(text, start, raw, spans).unwrap_or(raw)
    }

    /// Last sentence end in the trailing 20% of `[start, raw)`.
    fn sentence_break(
        &self,
        text: &str,
        start: usize,
        raw: usize,
        spans: &[CodeSpan],
    ) -> Option<usize> {
        let lookback = self.config.chunk_size / 5;
        let search_start = snap_to_char_boundary(text, raw.saturating_sub(lookback).max(start));
        let region = &text[search_start..raw];

        SENTENCE_ENDS
            .iter()
            .flat_map(|pat| region.match_indices(pat))
            .map(|(pos, _)| search_start + pos + 1)
            .filter(|&end| end > start && !spans.iter().any(|s| s.strictly_contains(end)))
            .max()
    }

    fn next_start(&self, text: &str, start: usize, end: usize, spans: &[CodeSpan]) -> usize {
        let max_chunk = self.config.chunk_size + self.config.chunk_size / 2;
        let mut next = snap_to_char_boundary(text, end.saturating_sub(self.config.chunk_overlap));

        // Do not open a window in the middle of a block that fits in one chunk.
        if let Some(span) = spans
            .iter()
            .find(|s| s.strictly_contains(next) && s.end - s.start <= max_chunk)
        {
            next = span.end.min(end);
        }

        if next > start {
            next
        } else {
            end
        }
    }
}

fn make_piece(
    text: &str,
    start: usize,
    end: usize,
    spans: &[CodeSpan],
    metadata: &ChunkMetadata,
) -> ChunkPiece {
    let mut metadata = metadata.clone();
    let mut touching = spans.iter().filter(|s| s.intersects(start, end));
    if let Some(first) = touching.next() {
        metadata.has_code = true;
        metadata.code_language = first
            .language
            .clone()
            .or_else(|| touching.find_map(|s| s.language.clone()));
    }

    ChunkPiece {
        text: text[start..end].trim().to_string(),
        start,
        end,
        metadata,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// First char boundary strictly after `index`.
fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}
