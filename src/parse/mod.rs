//! Format-specific text extraction.
//!
//! Each supported [`FileType`] has a [`DocumentParser`] that reads a file
//! from disk and yields its metadata plus a list of [`Segment`]s. A segment
//! is a run of text with one provenance: a PDF page, an EPUB chapter, or a
//! Markdown section. Ingestion chunks each segment separately so page and
//! chapter labels flow onto the chunks.
//!
//! Parsers are synchronous; callers run them on a blocking thread.

mod epub;
mod markup;
mod pdf;

use std::path::Path;

use anyhow::Result;

use docent_core::error::Error;
use docent_core::models::FileType;

pub use epub::EpubParser;
pub use markup::{HtmlParser, MarkdownParser, RstParser, TextParser};
pub use pdf::PdfParser;

/// Document-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument {
    pub title: String,
    pub author: Option<String>,
}

/// A run of extracted text with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
}

impl Segment {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page_number: None,
            chapter: None,
        }
    }
}

pub trait DocumentParser: Send + Sync {
    /// Reads title and author.
    fn parse(&self, path: &Path) -> Result<ParsedDocument>;

    /// Reads the document body as segments. Empty segments are omitted.
    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>>;
}

/// Returns the parser for a file type.
pub fn parser_for(file_type: FileType) -> Box<dyn DocumentParser> {
    match file_type {
        FileType::Pdf => Box::new(PdfParser),
        FileType::Epub => Box::new(EpubParser),
        FileType::Markdown => Box::new(MarkdownParser),
        FileType::Text => Box::new(TextParser),
        FileType::Rst => Box::new(RstParser),
        FileType::Html => Box::new(HtmlParser),
    }
}

/// Parses metadata and body in one pass, mapping failures to
/// [`Error::Parsing`] labelled with `display_name`.
pub fn parse_file(
    path: &Path,
    file_type: FileType,
    display_name: &str,
) -> docent_core::Result<(ParsedDocument, Vec<Segment>)> {
    let parser = parser_for(file_type);
    let parsed = parser
        .parse(path)
        .map_err(|e| Error::parsing(display_name, e))?;
    let segments = parser
        .extract_text(path)
        .map_err(|e| Error::parsing(display_name, e))?;
    Ok((parsed, segments))
}

/// File stem, used as the fallback title.
pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_string())
}

pub(crate) fn read_utf8(path: &Path) -> Result<String> {
    use anyhow::Context;
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_maps_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4 not really").unwrap();
        let err = parse_file(&path, FileType::Pdf, "broken.pdf").unwrap_err();
        assert!(matches!(err, Error::Parsing { ref file, .. } if file == "broken.pdf"));
    }

    #[test]
    fn test_parse_file_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello there").unwrap();
        let (doc, segments) = parse_file(&path, FileType::Text, "notes.txt").unwrap();
        assert_eq!(doc.title, "notes");
        assert_eq!(segments, vec![Segment::plain("hello there")]);
    }
}
