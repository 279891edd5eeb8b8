//! # Docent CLI (`docent`)
//!
//! Command-line front end for the Docent pipeline: ingest files into a
//! session, ask questions against them (optionally together with external
//! knowledge sources), and run the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./config/docent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent init` | Create the SQLite schema |
//! | `docent ingest <files>... --session <id>` | Validate, parse, chunk, embed, and index files |
//! | `docent ask "<question>" --session <id>` | Answer from the session's documents and sources |
//! | `docent forget <document_id> --session <id>` | Remove one document's chunks |
//! | `docent clear --session <id>` | Drop a session's collection |
//! | `docent sources` | List knowledge sources and their health |
//! | `docent serve` | Start the HTTP API |
//! | `docent completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! docent ingest ./manual.pdf ./notes.md --session demo
//! docent ask "How do I rotate the keys?" --session demo --source all --stream
//! docent ask "Summarize chapter 2" --session demo --percentage 2.5 --window 2
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use docent::app::App;
use docent::config::{self, Config};
use docent::{db, migrate, server};
use docent_core::models::{QueryEvent, QueryRequest};

/// Docent: retrieval-augmented answers over your documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docent.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docent",
    about = "Docent: retrieval-augmented answers over uploaded documents and external knowledge sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file and tables. Safe to run repeatedly.
    Init,

    /// Ingest one or more files into a session.
    ///
    /// Files are processed in order. A failing file stops the run; files
    /// ingested before it stay indexed.
    Ingest {
        /// Files to ingest (.pdf, .epub, .txt, .md, .rst, .html).
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Session (collection) to ingest into.
        #[arg(long)]
        session: String,
    },

    /// Ask a question.
    Ask {
        question: String,

        #[arg(long)]
        session: String,

        /// Where to look: `books`, `all`, or external source names.
        /// Repeatable. Defaults to `books`.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Number of local chunks to retrieve.
        #[arg(long, conflicts_with = "percentage")]
        top_k: Option<usize>,

        /// Retrieve this percentage of the collection (0.5 to 10).
        #[arg(long)]
        percentage: Option<f64>,

        /// Neighbor window around each match.
        #[arg(long)]
        window: Option<usize>,

        /// Override the configured generation model.
        #[arg(long)]
        model: Option<String>,

        /// Print tokens as they are generated.
        #[arg(long)]
        stream: bool,
    },

    /// Remove a document's chunks from a session.
    Forget {
        document_id: String,

        #[arg(long)]
        session: String,
    },

    /// Drop a session's collection.
    Clear {
        #[arg(long)]
        session: String,
    },

    /// List knowledge sources and whether they are reachable.
    Sources,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "docent", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Ingest { files, session } => {
            let app = App::build(cfg).await?;
            let result = run_ingest(&app, &files, &session).await;
            app.shutdown().await;
            result?;
        }
        Commands::Ask {
            question,
            session,
            sources,
            top_k,
            percentage,
            window,
            model,
            stream,
        } => {
            let mut request = QueryRequest::new(question, session);
            if !sources.is_empty() {
                request.sources = sources;
            }
            request.top_k = top_k;
            request.retrieval_percentage = percentage;
            request.neighbor_window = window;
            request.model = model;

            let app = App::build(cfg).await?;
            let result = if stream {
                run_ask_stream(&app, request).await
            } else {
                run_ask(&app, request).await
            };
            app.shutdown().await;
            result?;
        }
        Commands::Forget {
            document_id,
            session,
        } => {
            let app = App::build(cfg).await?;
            let result = app.ingestion.remove_document(&session, &document_id).await;
            app.shutdown().await;
            result?;
            println!("Removed {} from {}.", document_id, session);
        }
        Commands::Clear { session } => {
            let app = App::build(cfg).await?;
            let result = app.ingestion.clear_session(&session).await;
            app.shutdown().await;
            result?;
            println!("Cleared {}.", session);
        }
        Commands::Sources => {
            let app = App::build(cfg).await?;
            let statuses = app.sources.get_sources_status().await;
            app.shutdown().await;
            if statuses.is_empty() {
                println!("No knowledge sources configured.");
            }
            for status in statuses {
                let state = if status.available { "OK" } else { "UNAVAILABLE" };
                println!("{:<20} {:<24} {}", status.name, status.display_name, state);
            }
        }
        Commands::Serve => {
            let app = Arc::new(App::build(cfg).await?);
            tokio::select! {
                result = server::run_server(Arc::clone(&app)) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
            app.shutdown().await;
        }
        Commands::Completions { .. } => unreachable!("handled before config loading"),
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    if cfg.store.backend != "sqlite" {
        bail!(
            "init only applies to the sqlite backend (configured: {})",
            cfg.store.backend
        );
    }
    let pool = db::connect(&cfg.store).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized successfully.");
    Ok(())
}

async fn run_ingest(app: &App, files: &[PathBuf], session: &str) -> Result<()> {
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let document = app.ingestion.ingest(path, session, &name).await?;
        println!(
            "{}  {}  ({} chunks)",
            document.id, document.title, document.chunk_count
        );
    }
    Ok(())
}

async fn run_ask(app: &App, request: QueryRequest) -> Result<()> {
    let response = app.query.query(request).await?;
    println!("{}", response.answer);
    if !response.sources.is_empty() {
        println!("\nSources:");
        for chunk in &response.sources {
            let location = chunk.attribution().unwrap_or_else(|| "-".to_string());
            println!("  [{}] {}", chunk.document_id, location);
        }
    }
    if response.external_context_count > 0 {
        println!(
            "\n{} external context block(s) used.",
            response.external_context_count
        );
    }
    Ok(())
}

async fn run_ask_stream(app: &App, request: QueryRequest) -> Result<()> {
    let mut events = ReceiverStream::new(app.query.query_stream(request));
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            QueryEvent::Token { content } => {
                write!(stdout, "{}", content)?;
                stdout.flush()?;
            }
            QueryEvent::Sources {
                sources,
                external_context_count,
            } => {
                tracing::debug!(
                    local = sources.len(),
                    external = external_context_count,
                    "Context assembled"
                );
            }
            QueryEvent::Error { message } => bail!("{}", message),
            QueryEvent::Start { .. } | QueryEvent::Done { .. } => {}
        }
    }
    writeln!(stdout)?;
    Ok(())
}
