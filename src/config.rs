//! TOML configuration.
//!
//! Every section except `[store]` may be omitted; missing fields take the
//! defaults below. [`load_config`] validates the parsed result and reports
//! the first problem it finds.
//!
//! ```toml
//! [store]
//! backend = "sqlite"
//! path = "./data/docent.sqlite"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//!
//! [sources.compliance]
//! adapter = "compliance"
//! transport = "stdio"
//! command = "python"
//! args = ["-m", "aegis_mcp.server"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use docent_core::chunk::ChunkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `sqlite` or `memory`.
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/docent.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_children_per_parent")]
    pub children_per_parent: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            children_per_parent: default_children_per_parent(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            children_per_parent: self.children_per_parent,
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_children_per_parent() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_documents")]
    pub max_documents_per_session: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            max_documents_per_session: default_max_documents(),
        }
    }
}

fn default_max_file_size_mb() -> u64 {
    100
}
fn default_max_documents() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_neighbor_window")]
    pub neighbor_window: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            neighbor_window: default_neighbor_window(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_neighbor_window() -> usize {
    1
}
fn default_max_context_chars() -> usize {
    docent_core::prompt::DEFAULT_MAX_CONTEXT_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `ollama`, `openai`, or `local`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `ollama` or `openai`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            temperature: None,
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "ollama".to_string()
}
fn default_generation_model() -> String {
    "gemma3:12b".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

/// One external knowledge source reached over MCP.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Result layout: `compliance`, `docs`, or `export_control`.
    pub adapter: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// `stdio` or `http`.
    pub transport: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_source_timeout_secs() -> u64 {
    30
}
fn default_enabled() -> bool {
    true
}

const SOURCE_ADAPTERS: [&str; 3] = ["compliance", "docs", "export_control"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown store backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    // Validate chunking
    let chunking = &config.chunking;
    if chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if chunking.chunk_overlap >= chunking.chunk_size {
        bail!(
            "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
            chunking.chunk_overlap,
            chunking.chunk_size
        );
    }
    if chunking.children_per_parent == 0 {
        bail!("chunking.children_per_parent must be > 0");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        bail!("retrieval.max_context_chars must be > 0");
    }

    if config.upload.max_documents_per_session == 0 {
        bail!("upload.max_documents_per_session must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "ollama" | "openai" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be ollama, openai, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.generation.provider.as_str() {
        "ollama" | "openai" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be ollama or openai.",
            other
        ),
    }

    for (name, source) in &config.sources {
        if !SOURCE_ADAPTERS.contains(&source.adapter.as_str()) {
            bail!(
                "sources.{}.adapter: unknown adapter '{}'. Must be one of {}.",
                name,
                source.adapter,
                SOURCE_ADAPTERS.join(", ")
            );
        }
        match source.transport.as_str() {
            "stdio" => {
                if source.command.as_deref().map_or(true, str::is_empty) {
                    bail!("sources.{}.command is required for stdio transport", name);
                }
            }
            "http" => {
                if source.url.as_deref().map_or(true, str::is_empty) {
                    bail!("sources.{}.url is required for http transport", name);
                }
            }
            other => bail!(
                "sources.{}.transport: unknown transport '{}'. Must be stdio or http.",
                name,
                other
            ),
        }
        if source.timeout_secs == 0 {
            bail!("sources.{}.timeout_secs must be > 0", name);
        }
    }

    Ok(())
}
