//! Retrieval orchestration and answer generation.
//!
//! A query runs local retrieval (embed → search → neighbor expansion) and
//! the selected external sources concurrently, fuses the results into one
//! [`ContextPayload`], and hands it to the [`Generator`]. Local retrieval
//! failures propagate; external failures are absorbed by the registry.
//!
//! [`QueryService::query_stream`] runs the same flow on a spawned task and
//! reports progress as [`QueryEvent`]s over a bounded channel.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use docent_core::embedding::Embedder;
use docent_core::fusion::{fuse_context, resolve_top_k, substitute_parent_content, ContextPayload};
use docent_core::generate::{GenerationRequest, Generator};
use docent_core::index::VectorIndex;
use docent_core::models::{Chunk, QueryEvent, QueryRequest, QueryResponse, SourceSummary};
use docent_core::{Error, Result};

use crate::config::RetrievalConfig;
use crate::sources::SourceRegistry;

/// Capacity of the per-request event channel.
const EVENT_BUFFER: usize = 64;

const GENERATOR_SERVICE: &str = "generator";

/// The outcome of retrieval, ready for generation.
struct Retrieval {
    /// Search hits before expansion; reported back as sources.
    primary: Vec<Chunk>,
    context: ContextPayload,
    external_count: usize,
}

#[derive(Clone)]
pub struct QueryService {
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    sources: Arc<SourceRegistry>,
    retrieval: RetrievalConfig,
}

impl QueryService {
    pub fn new(
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        sources: Arc<SourceRegistry>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            sources,
            retrieval,
        }
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    /// Answers a question in one shot.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let retrieval = self.retrieve(&request).await?;

        let answer = self
            .generator
            .generate(generation_request(&request, retrieval.context))
            .await
            .map_err(|e| Error::unavailable(GENERATOR_SERVICE, e))?;

        Ok(QueryResponse {
            answer,
            sources: retrieval.primary,
            external_context_count: retrieval.external_count,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Answers a question as a stream of events.
    ///
    /// The stream always ends with exactly one `Done` or `Error`. Dropping
    /// the receiver abandons retrieval and stops generation at the next
    /// token.
    pub fn query_stream(&self, request: QueryRequest) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let service = self.clone();
        tokio::spawn(async move {
            service.run_stream(request, tx).await;
        });
        rx
    }

    async fn run_stream(&self, request: QueryRequest, tx: mpsc::Sender<QueryEvent>) {
        let start = QueryEvent::Start {
            status: "processing".to_string(),
        };
        if tx.send(start).await.is_err() {
            return;
        }

        let retrieval = tokio::select! {
            _ = tx.closed() => {
                debug!(session_id = %request.session_id, "Stream receiver dropped during retrieval");
                return;
            }
            retrieval = self.retrieve(&request) => retrieval,
        };
        let retrieval = match retrieval {
            Ok(r) => r,
            Err(e) => return send_error(&tx, e).await,
        };

        let sources = QueryEvent::Sources {
            sources: retrieval.primary.iter().map(SourceSummary::from).collect(),
            external_context_count: retrieval.external_count,
        };
        if tx.send(sources).await.is_err() {
            return;
        }

        let mut tokens = match self
            .generator
            .generate_stream(generation_request(&request, retrieval.context))
            .await
        {
            Ok(stream) => stream,
            Err(e) => return send_error(&tx, Error::unavailable(GENERATOR_SERVICE, e)).await,
        };

        while let Some(token) = tokens.next().await {
            match token {
                Ok(content) => {
                    if tx.send(QueryEvent::Token { content }).await.is_err() {
                        debug!(session_id = %request.session_id, "Stream receiver dropped during generation");
                        return;
                    }
                }
                Err(e) => return send_error(&tx, Error::unavailable(GENERATOR_SERVICE, e)).await,
            }
        }

        let _ = tx
            .send(QueryEvent::Done {
                status: "complete".to_string(),
            })
            .await;
    }

    /// Runs local and external retrieval concurrently and fuses the result.
    async fn retrieve(&self, request: &QueryRequest) -> Result<Retrieval> {
        if request.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".into()));
        }
        // Reject bad sizing before any I/O.
        resolve_top_k(
            request.top_k,
            request.retrieval_percentage,
            0,
            self.retrieval.top_k,
        )?;

        let selection = request.resolve_sources(&self.sources.available_sources());
        let external_top_k = request.top_k.unwrap_or(self.retrieval.top_k);

        let local = async {
            if selection.local {
                self.retrieve_local(request).await
            } else {
                Ok((Vec::new(), Vec::new()))
            }
        };
        let external = self.retrieve_external(&request.query, &selection.external, external_top_k);

        let (local, external) = tokio::join!(local, external);
        let (primary, expanded) = local?;

        let external_count = external.len();
        let generation_chunks = substitute_parent_content(expanded);
        debug!(
            primary = primary.len(),
            generation_chunks = generation_chunks.len(),
            external = external_count,
            "Retrieval complete"
        );

        Ok(Retrieval {
            primary,
            context: fuse_context(generation_chunks, external),
            external_count,
        })
    }

    /// Returns `(search hits, hits expanded with neighbors)`.
    async fn retrieve_local(&self, request: &QueryRequest) -> Result<(Vec<Chunk>, Vec<Chunk>)> {
        let session_id = request.session_id.as_str();
        let collection_size = self.index.get_collection_size(session_id).await?;
        if collection_size == 0 {
            debug!(session_id, "No local documents");
            return Ok((Vec::new(), Vec::new()));
        }

        let top_k = resolve_top_k(
            request.top_k,
            request.retrieval_percentage,
            collection_size,
            self.retrieval.top_k,
        )?;
        let window = request.neighbor_window.unwrap_or(self.retrieval.neighbor_window);
        debug!(session_id, collection_size, top_k, window, "Retrieval sizing");

        let embedding = self
            .embedder
            .embed_query(&request.query)
            .await
            .map_err(|e| Error::unavailable("embedding service", e))?;
        let primary = self.index.search(&embedding, session_id, top_k).await?;

        let expanded = if window > 0 {
            self.index
                .get_neighbor_chunks(&primary, session_id, window)
                .await?
        } else {
            primary.clone()
        };
        Ok((primary, expanded))
    }

    /// Queries each named source concurrently, in selection order.
    async fn retrieve_external(&self, query: &str, sources: &[String], top_k: usize) -> Vec<String> {
        let searches = sources
            .iter()
            .map(|name| self.sources.search_context(name, query, top_k));
        join_all(searches).await.into_iter().flatten().collect()
    }
}

fn generation_request(request: &QueryRequest, context: ContextPayload) -> GenerationRequest {
    GenerationRequest {
        question: request.query.clone(),
        context,
        history: request.history.clone(),
        model: request.model.clone(),
    }
}

async fn send_error(tx: &mpsc::Sender<QueryEvent>, error: Error) {
    warn!(error = %error, "Query failed");
    let _ = tx
        .send(QueryEvent::Error {
            message: error.to_string(),
        })
        .await;
}
