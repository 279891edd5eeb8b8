//! # Docent
//!
//! Retrieval-augmented question answering over uploaded documents and
//! external knowledge sources.
//!
//! Documents are validated, parsed into segments, split into parent/child
//! chunks, embedded, and stored in a per-session collection. A question is
//! answered from the session's closest chunks (widened by their sequence
//! neighbors) together with context pulled from MCP knowledge sources, and
//! the fused context is handed to a generator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Upload  │──▶│ Parse+Chunk  │──▶│ VectorIndex  │
//! │ validate │   │   +Embed     │   │ sqlite / mem │
//! └──────────┘   └──────────────┘   └──────┬───────┘
//!                                          │
//!        ┌──────────────┐          ┌───────▼──────┐   ┌───────────┐
//!        │ MCP sources  │─────────▶│ QueryService │──▶│ Generator │
//!        └──────────────┘          └───────┬──────┘   └───────────┘
//!                                          │
//!                              ┌───────────┴──────────┐
//!                              ▼                      ▼
//!                         ┌──────────┐          ┌──────────┐
//!                         │   CLI    │          │   HTTP   │
//!                         │ (docent) │          │  (axum)  │
//!                         └──────────┘          └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Process-lifetime wiring |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed vector store |
//! | [`embedding`] | Embedding providers |
//! | [`generate`] | Answer generators |
//! | [`parse`] | Document parsers |
//! | [`session`] | Per-session document bookkeeping |
//! | [`ingest`] | Upload-to-index pipeline |
//! | [`sources`] | MCP knowledge sources and registry |
//! | [`query`] | Retrieval orchestration |
//! | [`server`] | HTTP API |
//!
//! Format-independent pieces (chunker, validator, index adapter, fusion,
//! prompt builder, error taxonomy) live in the `docent-core` crate.

pub mod app;
pub mod config;
pub mod db;
pub mod embedding;
pub mod generate;
pub mod ingest;
pub mod migrate;
pub mod parse;
pub mod query;
pub mod server;
pub mod session;
pub mod sources;
pub mod sqlite_store;
