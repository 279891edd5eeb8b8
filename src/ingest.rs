//! Ingestion pipeline orchestration.
//!
//! Coordinates the upload flow for one file: capacity check → validation →
//! parsing → hierarchical chunking → embedding → storage. The session lock
//! is held for the whole run so the capacity check stays accurate under
//! concurrent uploads.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use docent_core::chunk::{ChunkMetadata, Chunker};
use docent_core::embedding::Embedder;
use docent_core::index::VectorIndex;
use docent_core::models::{Chunk, Document};
use docent_core::validate::FileValidator;
use docent_core::{Error, Result};

use crate::parse::{self, Segment};
use crate::session::SessionRegistry;

const EMBEDDING_SERVICE: &str = "embedding service";

pub struct IngestionService {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    sessions: Arc<SessionRegistry>,
    validator: FileValidator,
    chunker: Chunker,
    batch_size: usize,
}

impl IngestionService {
    pub fn new(
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        sessions: Arc<SessionRegistry>,
        validator: FileValidator,
        chunker: Chunker,
        batch_size: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            sessions,
            validator,
            chunker,
            batch_size: batch_size.max(1),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Ingests the file at `path` into `session_id`.
    ///
    /// `original_name` is the user-facing file name; it drives type
    /// detection and the title fallback, since `path` may be a temp file.
    pub async fn ingest(&self, path: &Path, session_id: &str, original_name: &str) -> Result<Document> {
        let mut documents = self.sessions.lock(session_id).await;
        if documents.len() >= self.sessions.max_documents() {
            return Err(Error::SessionCapacity {
                session_id: session_id.to_string(),
                max: self.sessions.max_documents(),
            });
        }

        let upload = self.validator.validate_file(path, original_name)?;
        let file_type = upload.file_type;

        let parse_path = path.to_path_buf();
        let display_name = upload.sanitized_name.clone();
        let (parsed, segments) = tokio::task::spawn_blocking(move || {
            parse::parse_file(&parse_path, file_type, &display_name)
        })
        .await
        .map_err(|e| Error::Internal(anyhow::anyhow!("parser task failed: {}", e)))??;

        let title = resolve_title(&parsed.title, original_name);
        let document_id = Uuid::new_v4().to_string();

        let mut chunks = self.chunk_segments(&segments, &document_id);
        if chunks.is_empty() {
            return Err(Error::parsing(
                upload.sanitized_name,
                "document contains no extractable text",
            ));
        }
        debug!(
            document_id = %document_id,
            segments = segments.len(),
            chunks = chunks.len(),
            "Chunked document"
        );

        self.embed_chunks(&mut chunks).await?;
        self.index.add_chunks(&chunks, session_id).await?;

        let document = Document {
            id: document_id,
            title,
            author: parsed.author,
            file_type,
            created_at: Utc::now(),
            chunk_count: chunks.len(),
        };
        info!(
            session_id,
            document_id = %document.id,
            title = %document.title,
            chunks = document.chunk_count,
            "Ingested document"
        );
        documents.push(document.clone());
        Ok(document)
    }

    /// Chunks each segment separately, numbering children continuously
    /// across the whole document.
    fn chunk_segments(&self, segments: &[Segment], document_id: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for segment in segments {
            let metadata = ChunkMetadata {
                page_number: segment.page_number,
                chapter: segment.chapter.clone(),
                ..Default::default()
            };
            let first_sequence = chunks.len() as u32;
            let pieces = self
                .chunker
                .chunk_hierarchical(&segment.text, &metadata, first_sequence);
            chunks.extend(pieces.into_iter().map(|p| p.into_chunk(document_id)));
        }
        chunks
    }

    async fn embed_chunks(&self, chunks: &mut [Chunk]) -> Result<()> {
        for batch in chunks.chunks_mut(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| Error::unavailable(EMBEDDING_SERVICE, e))?;
            if vectors.len() != batch.len() {
                return Err(Error::unavailable(
                    EMBEDDING_SERVICE,
                    format!("expected {} vectors, got {}", batch.len(), vectors.len()),
                ));
            }
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
        }
        Ok(())
    }

    /// Removes a document and its chunks.
    ///
    /// Chunks are deleted even when the session registry does not know the
    /// document, as happens after a restart. It is an error only when
    /// neither held it.
    pub async fn remove_document(&self, session_id: &str, document_id: &str) -> Result<()> {
        let known = match self.sessions.remove_document(session_id, document_id).await {
            Ok(_) => true,
            Err(Error::DocumentNotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        let removed = self.index.delete_book_chunks(session_id, document_id).await?;
        if !known && removed == 0 {
            return Err(Error::DocumentNotFound {
                session_id: session_id.to_string(),
                document_id: document_id.to_string(),
            });
        }
        info!(session_id, document_id, removed, "Removed document");
        Ok(())
    }

    /// Drops every document in the session along with its collection.
    ///
    /// The document list is emptied under the session lock rather than
    /// unregistered, so an ingest queued behind the clear sees the same,
    /// now empty, list.
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        let mut documents = self.sessions.lock(session_id).await;
        self.index.delete_collection(session_id).await?;
        documents.clear();
        info!(session_id, "Cleared session");
        Ok(())
    }
}

/// Parsed titles of uploads saved under temp names (`tmpab12cd.pdf`) or
/// too short to mean anything fall back to the uploaded file's stem.
fn resolve_title(parsed: &str, original_name: &str) -> String {
    let parsed = parsed.trim();
    if parsed.starts_with("tmp") || parsed.chars().count() < 3 {
        Path::new(original_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| parsed.to_string())
    } else {
        parsed.to_string()
    }
}
