//! Error taxonomy shared by every Docent component.
//!
//! Each variant belongs to one [`ErrorKind`]. Callers (the HTTP layer in
//! particular) branch on the kind rather than on individual variants:
//!
//! | Kind | Meaning | Retry |
//! |------|---------|-------|
//! | `Validation` | Bad upload or request | never |
//! | `Parsing` | Document could not be read | never |
//! | `SessionCapacity` | Session already full | never |
//! | `NotFound` | Unknown document | never |
//! | `ServiceUnavailable` | Embedder, index, or generator failed | caller's choice |
//! | `Internal` | Anything else | never |
//!
//! External knowledge sources never produce an `Error`; their failures are
//! absorbed by the query service.

use thiserror::Error;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Parsing,
    SessionCapacity,
    NotFound,
    ServiceUnavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported file type: {extension}")]
    UnsupportedFileType { extension: String },

    #[error("file size {size_mb:.1}MB exceeds limit of {limit_mb}MB")]
    FileTooLarge { size_mb: f64, limit_mb: u64 },

    #[error("file content does not match extension {extension}: {reason}")]
    ContentMismatch { extension: String, reason: String },

    #[error("suspicious filename: {0}")]
    SuspiciousFilename(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("chunk {chunk_id} has no embedding")]
    MissingEmbedding { chunk_id: String },

    #[error("failed to parse {file}: {message}")]
    Parsing { file: String, message: String },

    #[error("session {session_id} already holds the maximum of {max} documents")]
    SessionCapacity { session_id: String, max: usize },

    #[error("document {document_id} not found in session {session_id}")]
    DocumentNotFound {
        session_id: String,
        document_id: String,
    },

    #[error("{service} unavailable: {message}")]
    ServiceUnavailable {
        service: &'static str,
        message: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedFileType { .. }
            | Error::FileTooLarge { .. }
            | Error::ContentMismatch { .. }
            | Error::SuspiciousFilename(_)
            | Error::InvalidRequest(_)
            | Error::InvalidConfig(_)
            | Error::MissingEmbedding { .. } => ErrorKind::Validation,
            Error::Parsing { .. } => ErrorKind::Parsing,
            Error::SessionCapacity { .. } => ErrorKind::SessionCapacity,
            Error::DocumentNotFound { .. } => ErrorKind::NotFound,
            Error::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wraps a backend failure as a connectivity error for `service`.
    ///
    /// Uses the alternate format so an `anyhow` context chain is kept in
    /// the message.
    pub fn unavailable(service: &'static str, err: impl std::fmt::Display) -> Self {
        Error::ServiceUnavailable {
            service,
            message: format!("{err:#}"),
        }
    }

    pub fn parsing(file: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Parsing {
            file: file.into(),
            message: format!("{message:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
