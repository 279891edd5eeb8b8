use std::path::Path;

use anyhow::{anyhow, Context, Result};

use super::{file_stem, DocumentParser, ParsedDocument, Segment};

/// Page-aware PDF text extraction via `pdf-extract`.
///
/// `pdf-extract` separates pages with a form feed; each page becomes one
/// segment numbered from 1. Blank pages are skipped but still counted.
pub struct PdfParser;

fn extract_pages(bytes: &[u8]) -> Result<Vec<Segment>> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| anyhow!("PDF extraction failed: {}", e))?;
    Ok(split_pages(&text))
}

fn split_pages(text: &str) -> Vec<Segment> {
    text.split('\x0c')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| Segment {
            text: page.trim().to_string(),
            page_number: Some(i as u32 + 1),
            chapter: None,
        })
        .collect()
}

impl DocumentParser for PdfParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        // pdf-extract exposes no document info dictionary.
        Ok(ParsedDocument {
            title: file_stem(path),
            author: None,
        })
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        extract_pages(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pages_numbers_from_one() {
        let pages = split_pages("first page\x0c\n \x0cthird page\x0c");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].text, "first page");
        assert_eq!(pages[0].page_number, Some(1));
        assert_eq!(pages[1].text, "third page");
        assert_eq!(pages[1].page_number, Some(3));
    }

    #[test]
    fn test_invalid_pdf_returns_error() {
        assert!(extract_pages(b"not a pdf").is_err());
    }
}
