//! Upload validation and filename sanitization.
//!
//! Checks run in a fixed order, cheapest first: extension and suspicious
//! names, then size, then the content signature. The first failure wins.

use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::FileType;

/// Bytes inspected for signatures and UTF-8 validity.
const HEAD_BYTES: usize = 1024;

const SUSPICIOUS_PATTERNS: [&str; 3] = [".exe", ".sh", ".bat"];

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub file_type: FileType,
    pub sanitized_name: String,
}

#[derive(Debug, Clone)]
pub struct FileValidator {
    max_file_size_mb: u64,
}

impl Default for FileValidator {
    fn default() -> Self {
        Self::new(100)
    }
}

impl FileValidator {
    pub fn new(max_file_size_mb: u64) -> Self {
        Self { max_file_size_mb }
    }

    pub fn max_file_size_mb(&self) -> u64 {
        self.max_file_size_mb
    }

    /// Returns the file type for an allowed, non-suspicious name.
    pub fn validate_extension(&self, filename: &str) -> Result<FileType> {
        let lower = filename.to_lowercase();
        if SUSPICIOUS_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Err(Error::SuspiciousFilename(filename.to_string()));
        }
        let ext = extension_of(&lower);
        FileType::from_extension(&ext).ok_or(Error::UnsupportedFileType { extension: ext })
    }

    pub fn validate_file_size(&self, size_bytes: u64) -> Result<()> {
        let limit = self.max_file_size_mb * 1024 * 1024;
        if size_bytes > limit {
            return Err(Error::FileTooLarge {
                size_mb: size_bytes as f64 / (1024.0 * 1024.0),
                limit_mb: self.max_file_size_mb,
            });
        }
        Ok(())
    }

    /// Checks the leading bytes against the declared type.
    pub fn validate_content(&self, head: &[u8], file_type: FileType) -> Result<()> {
        let mismatch = |reason: &str| Error::ContentMismatch {
            extension: file_type.as_str().to_string(),
            reason: reason.to_string(),
        };
        let head = &head[..head.len().min(HEAD_BYTES)];

        match file_type {
            FileType::Pdf if !head.starts_with(b"%PDF") => Err(mismatch("missing %PDF header")),
            FileType::Epub if !head.starts_with(b"PK") => Err(mismatch("not a zip container")),
            t if t.is_text() => match std::str::from_utf8(head) {
                Ok(_) => Ok(()),
                // A multibyte character cut at the edge of the sample is fine.
                Err(e) if e.error_len().is_none() => Ok(()),
                Err(_) => Err(mismatch("not valid UTF-8 text")),
            },
            _ => Ok(()),
        }
    }

    /// Runs every check against an in-memory upload.
    pub fn validate_bytes(&self, original_name: &str, bytes: &[u8]) -> Result<ValidatedUpload> {
        let file_type = self.validate_extension(original_name)?;
        self.validate_file_size(bytes.len() as u64)?;
        self.validate_content(bytes, file_type)?;
        Ok(ValidatedUpload {
            file_type,
            sanitized_name: sanitize_filename(original_name),
        })
    }

    /// Runs every check against a file on disk, reading only its head.
    ///
    /// `original_name` is the name the user supplied; `path` may be a
    /// temporary file with an arbitrary name.
    pub fn validate_file(&self, path: &Path, original_name: &str) -> Result<ValidatedUpload> {
        let file_type = self.validate_extension(original_name)?;

        let size = std::fs::metadata(path)
            .map_err(|e| Error::parsing(original_name, e))?
            .len();
        self.validate_file_size(size)?;

        let mut head = Vec::with_capacity(HEAD_BYTES);
        std::fs::File::open(path)
            .and_then(|f| f.take(HEAD_BYTES as u64).read_to_end(&mut head))
            .map_err(|e| Error::parsing(original_name, e))?;
        self.validate_content(&head, file_type)?;

        Ok(ValidatedUpload {
            file_type,
            sanitized_name: sanitize_filename(original_name),
        })
    }
}

/// Lowercased extension with its leading dot, or `""`.
fn extension_of(name: &str) -> String {
    let base = basename(name);
    match base.rfind('.') {
        Some(pos) if pos > 0 => base[pos..].to_lowercase(),
        _ => String::new(),
    }
}

fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Produces a filesystem-safe name from untrusted user input.
///
/// Keeps only the basename, neutralizes `..`, maps everything outside
/// `[A-Za-z0-9_-]` in the stem to `_`, and lowercases the extension.
pub fn sanitize_filename(name: &str) -> String {
    let base = basename(name).replace("..", "_");

    let (stem, ext) = match base.rfind('.') {
        Some(pos) if pos > 0 => (&base[..pos], base[pos..].to_lowercase()),
        _ => (base.as_str(), String::new()),
    };

    let mut cleaned = String::with_capacity(stem.len());
    for c in stem.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && cleaned.ends_with('_') {
            continue;
        }
        cleaned.push(c);
    }
    let cleaned = cleaned.trim_matches('_');
    let stem = if cleaned.is_empty() { "unnamed" } else { cleaned };

    format!("{}{}", stem, ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_allowed_extensions() {
        let v = FileValidator::default();
        assert_eq!(v.validate_extension("book.PDF").unwrap(), FileType::Pdf);
        assert_eq!(v.validate_extension("notes.md").unwrap(), FileType::Markdown);
        assert_eq!(v.validate_extension("page.htm").unwrap(), FileType::Html);
        assert!(matches!(
            v.validate_extension("data.docx"),
            Err(Error::UnsupportedFileType { .. })
        ));
        assert!(matches!(
            v.validate_extension("README"),
            Err(Error::UnsupportedFileType { .. })
        ));
    }

    #[test]
    fn test_suspicious_names() {
        let v = FileValidator::default();
        for name in ["setup.exe.pdf", "run.sh.txt", "x.BAT.md"] {
            assert!(
                matches!(v.validate_extension(name), Err(Error::SuspiciousFilename(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn test_size_limit() {
        let v = FileValidator::new(1);
        assert!(v.validate_file_size(1024 * 1024).is_ok());
        let err = v.validate_file_size(1024 * 1024 + 1).unwrap_err();
        assert!(matches!(err, Error::FileTooLarge { limit_mb: 1, .. }));
    }

    #[test]
    fn test_content_signatures() {
        let v = FileValidator::default();
        assert!(v.validate_content(b"%PDF-1.7 ...", FileType::Pdf).is_ok());
        assert!(v.validate_content(b"<html>", FileType::Pdf).is_err());
        assert!(v.validate_content(b"PK\x03\x04", FileType::Epub).is_ok());
        assert!(v.validate_content(b"%PDF", FileType::Epub).is_err());
        assert!(v.validate_content("# Título".as_bytes(), FileType::Markdown).is_ok());
        assert!(v.validate_content(&[0xff, 0xfe, 0x00], FileType::Text).is_err());
    }

    #[test]
    fn test_truncated_multibyte_at_sample_edge() {
        let v = FileValidator::default();
        let mut bytes = vec![b'a'; HEAD_BYTES - 1];
        bytes.extend_from_slice("é".as_bytes());
        assert!(v.validate_content(&bytes, FileType::Text).is_ok());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("My Book (v2).PDF"), "My_Book_v2.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd.txt"), "passwd.txt");
        assert_eq!(sanitize_filename("C:\\docs\\report.md"), "report.md");
        assert_eq!(sanitize_filename("a..b.md"), "a_b.md");
        assert_eq!(sanitize_filename("***.txt"), "unnamed.txt");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_validate_bytes() {
        let v = FileValidator::default();
        let ok = v.validate_bytes("Guide.MD", b"# Guide\n").unwrap();
        assert_eq!(ok.file_type, FileType::Markdown);
        assert_eq!(ok.sanitized_name, "Guide.md");

        assert!(matches!(
            v.validate_bytes("fake.pdf", b"hello"),
            Err(Error::ContentMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_file() {
        let dir = std::env::temp_dir().join(format!("docent-validate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("upload.tmp");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"plain text body")
            .unwrap();

        let v = FileValidator::default();
        let ok = v.validate_file(&path, "notes.txt").unwrap();
        assert_eq!(ok.file_type, FileType::Text);
        assert!(v.validate_file(&path, "notes.pdf").is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
