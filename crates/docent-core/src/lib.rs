//! # Docent Core
//!
//! Runtime-agnostic logic for Docent: data models, the error taxonomy,
//! chunking, upload validation, the vector store abstraction and index
//! adapter, retrieval sizing and context fusion, prompt assembly, and the
//! embedding and generation capability traits.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem-walking code.
//! The `docent` crate wires these pieces to real backends.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod generate;
pub mod index;
pub mod models;
pub mod prompt;
pub mod store;
pub mod validate;

pub use error::{Error, ErrorKind, Result};
