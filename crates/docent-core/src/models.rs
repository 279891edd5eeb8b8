//! Core data models shared across ingestion, retrieval, and the API.
//!
//! | Type | Role |
//! |------|------|
//! | [`Chunk`] | Atomic retrieval unit stored in the vector index |
//! | [`Document`] | One ingested file within a session |
//! | [`QueryRequest`] / [`QueryResponse`] | Question in, grounded answer out |
//! | [`QueryEvent`] | Streaming variant of a response |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The smallest retrievable unit of document text.
///
/// `content` is what gets embedded and matched. `parent_content`, when set,
/// is the text of the whole parent window and is what the generator sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub chapter: Option<String>,
    #[serde(default)]
    pub has_code: bool,
    #[serde(default)]
    pub code_language: Option<String>,
    pub sequence_number: u32,
    #[serde(default)]
    pub parent_chunk_id: Option<String>,
    #[serde(default)]
    pub parent_content: Option<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// `Chapter: X, Page N`, using whichever parts are known.
    pub fn attribution(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(chapter) = &self.chapter {
            parts.push(format!("Chapter: {}", chapter));
        }
        if let Some(page) = self.page_number {
            parts.push(format!("Page {}", page));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Epub,
    Markdown,
    Text,
    Rst,
    Html,
}

impl FileType {
    /// Maps a lowercase extension with leading dot (e.g. `".md"`).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            ".pdf" => Some(FileType::Pdf),
            ".epub" => Some(FileType::Epub),
            ".md" => Some(FileType::Markdown),
            ".txt" => Some(FileType::Text),
            ".rst" => Some(FileType::Rst),
            ".html" | ".htm" => Some(FileType::Html),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Epub => "epub",
            FileType::Markdown => "markdown",
            FileType::Text => "text",
            FileType::Rst => "rst",
            FileType::Html => "html",
        }
    }

    /// True for formats that must be valid UTF-8.
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            FileType::Markdown | FileType::Text | FileType::Rst | FileType::Html
        )
    }
}

/// One successfully ingested file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub file_type: FileType,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A prior turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Source selector meaning "the session's uploaded documents".
pub const LOCAL_SOURCE: &str = "books";
/// Source selector meaning "local documents and every registered source".
pub const ALL_SOURCES: &str = "all";

fn default_sources() -> Vec<String> {
    vec![LOCAL_SOURCE.to_string()]
}

/// A question to answer against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub session_id: String,
    /// `books` (or `local`), `all`, or names of external sources.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Corpus-relative sizing, 0.5 to 10.0 percent of the collection.
    #[serde(default)]
    pub retrieval_percentage: Option<f64>,
    #[serde(default)]
    pub neighbor_window: Option<usize>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: session_id.into(),
            sources: default_sources(),
            top_k: None,
            retrieval_percentage: None,
            neighbor_window: None,
            history: Vec::new(),
            model: None,
        }
    }

    /// Resolves the source list into the local flag plus external names.
    ///
    /// `all` expands to every name in `registered`. Names are deduplicated
    /// in first-seen order; unknown names pass through untouched.
    pub fn resolve_sources(&self, registered: &[String]) -> SourceSelection {
        let mut selection = SourceSelection::default();
        for source in &self.sources {
            match source.as_str() {
                LOCAL_SOURCE | "local" => selection.local = true,
                ALL_SOURCES => {
                    selection.local = true;
                    for name in registered {
                        selection.push_external(name);
                    }
                }
                other => selection.push_external(other),
            }
        }
        selection
    }
}

/// Which sources a request reads from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSelection {
    pub local: bool,
    pub external: Vec<String>,
}

impl SourceSelection {
    fn push_external(&mut self, name: &str) {
        if !self.external.iter().any(|n| n == name) {
            self.external.push(name.to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    /// Primary matches only, never neighbor-expanded.
    pub sources: Vec<Chunk>,
    pub external_context_count: usize,
    pub latency_ms: u64,
}

/// Compact attribution record sent in the `sources` stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub content: String,
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
    pub document_id: String,
}

const SUMMARY_CHARS: usize = 200;

impl From<&Chunk> for SourceSummary {
    fn from(chunk: &Chunk) -> Self {
        let content = match chunk.content.char_indices().nth(SUMMARY_CHARS) {
            Some((cut, _)) => format!("{}...", &chunk.content[..cut]),
            None => chunk.content.clone(),
        };
        Self {
            content,
            page_number: chunk.page_number,
            chapter: chunk.chapter.clone(),
            document_id: chunk.document_id.clone(),
        }
    }
}

/// Signals emitted by a streaming query, in order:
/// `Start`, `Sources`, zero or more `Token`, then `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueryEvent {
    Start {
        status: String,
    },
    Sources {
        sources: Vec<SourceSummary>,
        external_context_count: usize,
    },
    Token {
        content: String,
    },
    Done {
        status: String,
    },
    Error {
        message: String,
    },
}

impl QueryEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            QueryEvent::Start { .. } => "start",
            QueryEvent::Sources { .. } => "sources",
            QueryEvent::Token { .. } => "token",
            QueryEvent::Done { .. } => "done",
            QueryEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryEvent::Done { .. } | QueryEvent::Error { .. })
    }
}
