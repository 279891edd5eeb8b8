//! HTTP API.
//!
//! Thin axum layer over [`App`]: uploads go to the ingestion service,
//! questions go to the query service, and every handler maps
//! [`docent_core::Error`] onto a status code through [`AppError`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Status, version, generator reachability |
//! | `GET`    | `/models` | Models the generator can serve |
//! | `GET`    | `/sources` | Knowledge source availability |
//! | `GET`    | `/sessions/{session_id}/documents` | Documents in a session |
//! | `POST`   | `/sessions/{session_id}/documents` | Multipart upload, one or more `file` fields |
//! | `DELETE` | `/sessions/{session_id}/documents/{document_id}` | Remove one document |
//! | `DELETE` | `/sessions/{session_id}` | Drop the session and its collection |
//! | `POST`   | `/chat` | Answer a question |
//! | `POST`   | `/chat/stream` | Answer as server-sent events |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "session_full", "message": "session s1 already holds the maximum of 5 documents" } }
//! ```
//!
//! Codes: `validation_error` (400), `not_found` (404), `session_full` (409),
//! `parsing_error` (422), `internal_error` (500), `service_unavailable` (503).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser front end
//! can be served from anywhere.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use docent_core::models::{Document, QueryRequest, QueryResponse};
use docent_core::{Error, ErrorKind};

use crate::app::App;
use crate::sources::SourceStatus;

const MB: usize = 1024 * 1024;

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = router(app);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "HTTP server listening");
    axum::serve(listener, router).await?;

    Ok(())
}

/// Builds the router with CORS and the upload body limit applied.
pub fn router(app: Arc<App>) -> Router {
    let upload = &app.config.upload;
    let body_limit = (upload.max_file_size_mb as usize + 1)
        .saturating_mul(upload.max_documents_per_session.max(1))
        .saturating_mul(MB);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/models", get(handle_models))
        .route("/sources", get(handle_sources))
        .route(
            "/sessions/{session_id}/documents",
            get(handle_list_documents).post(handle_upload),
        )
        .route(
            "/sessions/{session_id}/documents/{document_id}",
            delete(handle_delete_document),
        )
        .route("/sessions/{session_id}", delete(handle_clear_session))
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"session_full"`).
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match err.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation_error"),
            ErrorKind::Parsing => (StatusCode::UNPROCESSABLE_ENTITY, "parsing_error"),
            ErrorKind::SessionCapacity => (StatusCode::CONFLICT, "session_full"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::ServiceUnavailable => {
                error!(error = %err, "Backing service unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ErrorKind::Internal => {
                error!(error = ?err, "Unhandled error");
                return AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal_error".to_string(),
                    message: "internal server error".to_string(),
                };
            }
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation_error".to_string(),
        message: message.into(),
    }
}

// ============ GET /health, /models, /sources ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    /// Whether the answer generator is reachable.
    generator: bool,
}

async fn handle_health(State(app): State<Arc<App>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        generator: app.query.generator().health_check().await,
    })
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<String>,
}

async fn handle_models(State(app): State<Arc<App>>) -> Result<Json<ModelsResponse>, AppError> {
    let models = app
        .query
        .generator()
        .list_models()
        .await
        .map_err(|e| Error::unavailable("generator", e))?;
    Ok(Json(ModelsResponse { models }))
}

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceStatus>,
}

async fn handle_sources(State(app): State<Arc<App>>) -> Json<SourcesResponse> {
    Json(SourcesResponse {
        sources: app.sources.get_sources_status().await,
    })
}

// ============ /sessions ============

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
) -> Json<DocumentsResponse> {
    Json(DocumentsResponse {
        documents: app.sessions.documents(&session_id).await,
    })
}

/// Ingests every `file` field in order. A failing file aborts the request,
/// but files ingested before it stay in the session.
async fn handle_upload(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentsResponse>), AppError> {
    let mut documents = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("file field has no filename"))?;
        let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
        documents.push(ingest_upload(&app, &session_id, &name, &bytes).await?);
    }

    if documents.is_empty() {
        return Err(bad_request("no file fields in upload"));
    }
    Ok((StatusCode::CREATED, Json(DocumentsResponse { documents })))
}

/// Spools the upload to a temp file that keeps the original extension,
/// since parsers work on paths.
async fn ingest_upload(
    app: &App,
    session_id: &str,
    name: &str,
    bytes: &[u8],
) -> Result<Document, AppError> {
    let suffix = std::path::Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let tmp = tempfile::Builder::new()
        .prefix("docent-upload-")
        .suffix(&suffix)
        .tempfile()
        .map_err(|e| Error::Internal(e.into()))?;
    tokio::fs::write(tmp.path(), bytes)
        .await
        .map_err(|e| Error::Internal(e.into()))?;

    Ok(app.ingestion.ingest(tmp.path(), session_id, name).await?)
}

async fn handle_delete_document(
    State(app): State<Arc<App>>,
    Path((session_id, document_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    app.ingestion
        .remove_document(&session_id, &document_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_clear_session(
    State(app): State<Arc<App>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    app.ingestion.clear_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ /chat ============

async fn handle_chat(
    State(app): State<Arc<App>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    Ok(Json(app.query.query(request).await?))
}

/// Streams `start`, `sources`, `token`..., then `done` or `error`. The
/// stream ends after the terminal event; a client that disconnects early
/// drops the receiver, which stops the pipeline.
async fn handle_chat_stream(
    State(app): State<Arc<App>>,
    Json(request): Json<QueryRequest>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = ReceiverStream::new(app.query.query_stream(request)).map(|event| {
        Event::default().event(event.name()).json_data(&event)
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sources::tests::FakeSource;
    use crate::sources::{SourceRegistry, DEFAULT_SOURCE_TIMEOUT};
    use async_trait::async_trait;
    use docent_core::embedding::Embedder;
    use docent_core::fusion::ContextPayload;
    use docent_core::generate::{GenerationRequest, Generator, TokenStream};
    use serde_json::Value;

    /// Buckets bytes into a small fixed-width vector.
    struct ByteEmbedder;

    #[async_trait]
    impl Embedder for ByteEmbedder {
        fn model_name(&self) -> &str {
            "bytes"
        }

        fn dims(&self) -> usize {
            8
        }

        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.1f32; 8];
                    for b in t.bytes() {
                        v[(b % 8) as usize] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    /// Answers with the shape and size of the context it was given.
    struct CountingGenerator;

    #[async_trait]
    impl Generator for CountingGenerator {
        async fn generate(&self, request: GenerationRequest) -> anyhow::Result<String> {
            Ok(match request.context {
                ContextPayload::Chunks(chunks) => format!("{} chunks", chunks.len()),
                ContextPayload::Texts(texts) => format!("{} texts", texts.len()),
            })
        }

        async fn generate_stream(&self, request: GenerationRequest) -> anyhow::Result<TokenStream> {
            let answer = self.generate(request).await?;
            let tokens: Vec<anyhow::Result<String>> = answer
                .split_inclusive(' ')
                .map(|t| Ok(t.to_string()))
                .collect();
            Ok(futures::stream::iter(tokens).boxed())
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn list_models(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["counting".into()])
        }
    }

    async fn spawn_server(max_documents: usize) -> String {
        let mut config: Config = toml::from_str("[store]\nbackend = \"memory\"\n").unwrap();
        config.upload.max_documents_per_session = max_documents;

        let mut sources = SourceRegistry::new();
        sources.register(
            Arc::new(FakeSource::new("docs", &["[Source: Fake]\nexternal block"])),
            DEFAULT_SOURCE_TIMEOUT,
        );
        let app = App::with_components(
            config,
            Arc::new(ByteEmbedder),
            Arc::new(CountingGenerator),
            sources,
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(Arc::new(app))).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn markdown_form(name: &str) -> reqwest::multipart::Form {
        let body = "# Field Notes\n\nThe river rises in spring.\n\n## Later\n\nIt falls in autumn.\n";
        reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(body.as_bytes().to_vec()).file_name(name.to_string()),
        )
    }

    #[tokio::test]
    async fn test_health_models_and_sources() {
        let base = spawn_server(5).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["generator"], true);

        let models: Value = client
            .get(format!("{base}/models"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(models["models"][0], "counting");

        let sources: Value = client
            .get(format!("{base}/sources"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sources["sources"][0]["name"], "docs");
        assert_eq!(sources["sources"][0]["available"], true);
    }

    #[tokio::test]
    async fn test_upload_list_chat_and_delete() {
        let base = spawn_server(5).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/sessions/s1/documents"))
            .multipart(markdown_form("notes.md"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["documents"][0]["title"], "Field Notes");
        let document_id = body["documents"][0]["id"].as_str().unwrap().to_string();

        let listed: Value = client
            .get(format!("{base}/sessions/s1/documents"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["documents"].as_array().unwrap().len(), 1);

        let answer: Value = client
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({
                "query": "when does the river rise?",
                "session_id": "s1",
                "sources": ["all"]
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(answer["external_context_count"], 1);
        assert!(answer["answer"].as_str().unwrap().ends_with(" texts"));
        assert!(!answer["sources"].as_array().unwrap().is_empty());

        let resp = client
            .delete(format!("{base}/sessions/s1/documents/{document_id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);

        let resp = client
            .delete(format!("{base}/sessions/s1/documents/{document_id}"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_upload_errors_map_to_status_codes() {
        let base = spawn_server(1).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/sessions/s1/documents"))
            .multipart(markdown_form("payload.exe"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "validation_error");

        let resp = client
            .post(format!("{base}/sessions/s1/documents"))
            .multipart(markdown_form("one.md"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

        let resp = client
            .post(format!("{base}/sessions/s1/documents"))
            .multipart(markdown_form("two.md"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "session_full");

        let resp = client
            .delete(format!("{base}/sessions/s1"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_query() {
        let base = spawn_server(5).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({ "query": "", "session_id": "s1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_stream_event_order() {
        let base = spawn_server(5).await;
        let body = reqwest::Client::new()
            .post(format!("{base}/chat/stream"))
            .json(&serde_json::json!({ "query": "anything", "session_id": "empty" }))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let names: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(names.first(), Some(&"start"));
        assert_eq!(names.get(1), Some(&"sources"));
        assert_eq!(names.last(), Some(&"done"));
        assert!(names.contains(&"token"));
    }
}
