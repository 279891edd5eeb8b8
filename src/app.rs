//! Process-lifetime wiring.
//!
//! [`App`] owns every long-lived resource: the SQLite pool (when the sqlite
//! backend is selected), provider clients, MCP sessions, and the session
//! registry. The CLI and the HTTP server both build one `App` and call
//! [`App::shutdown`] on the way out.

use std::sync::Arc;

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tracing::info;

use docent_core::chunk::Chunker;
use docent_core::embedding::Embedder;
use docent_core::generate::Generator;
use docent_core::index::VectorIndex;
use docent_core::prompt::PromptBuilder;
use docent_core::store::memory::InMemoryVectorStore;
use docent_core::store::VectorStore;
use docent_core::validate::FileValidator;

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generate::create_generator;
use crate::ingest::IngestionService;
use crate::migrate;
use crate::query::QueryService;
use crate::session::SessionRegistry;
use crate::sources::SourceRegistry;
use crate::sqlite_store::SqliteVectorStore;

pub struct App {
    pub config: Arc<Config>,
    pub index: VectorIndex,
    pub sessions: Arc<SessionRegistry>,
    pub ingestion: Arc<IngestionService>,
    pub query: QueryService,
    pub sources: Arc<SourceRegistry>,
    pool: Option<SqlitePool>,
}

impl App {
    /// Builds the app from configuration and connects all sources.
    pub async fn build(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let prompts = PromptBuilder::new(config.retrieval.max_context_chars);
        let generator = create_generator(&config.generation, prompts)?;
        let sources = SourceRegistry::from_config(&config.sources)?;
        Self::with_components(config, embedder, generator, sources).await
    }

    /// Builds the app around caller-supplied providers and sources.
    pub async fn with_components(
        config: Config,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        sources: SourceRegistry,
    ) -> Result<Self> {
        let (store, pool) = open_store(&config).await?;
        let index = VectorIndex::new(store);

        let sessions = Arc::new(SessionRegistry::new(
            config.upload.max_documents_per_session,
        ));
        let chunker = Chunker::new(config.chunking.chunker_config())?;
        let ingestion = Arc::new(IngestionService::new(
            index.clone(),
            Arc::clone(&embedder),
            Arc::clone(&sessions),
            FileValidator::new(config.upload.max_file_size_mb),
            chunker,
            config.embedding.batch_size,
        ));

        sources.connect_all().await;
        let sources = Arc::new(sources);
        let query = QueryService::new(
            index.clone(),
            embedder,
            generator,
            Arc::clone(&sources),
            config.retrieval.clone(),
        );

        info!(
            store = %config.store.backend,
            embedding = %config.embedding.provider,
            generation = %config.generation.provider,
            sources = sources.len(),
            "Application ready"
        );

        Ok(Self {
            config: Arc::new(config),
            index,
            sessions,
            ingestion,
            query,
            sources,
            pool,
        })
    }

    /// Disconnects sources and closes the database pool.
    pub async fn shutdown(&self) {
        self.sources.disconnect_all().await;
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!("Application shut down");
    }
}

async fn open_store(config: &Config) -> Result<(Arc<dyn VectorStore>, Option<SqlitePool>)> {
    match config.store.backend.as_str() {
        "sqlite" => {
            let pool = db::connect(&config.store).await?;
            migrate::run_migrations(&pool).await?;
            let store = SqliteVectorStore::new(pool.clone());
            Ok((Arc::new(store), Some(pool)))
        }
        "memory" => Ok((Arc::new(InMemoryVectorStore::new()), None)),
        other => bail!("Unknown store backend: '{}'", other),
    }
}
