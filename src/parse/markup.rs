//! Parsers for plain-text formats: text, Markdown, reStructuredText, HTML.

use std::path::Path;

use anyhow::Result;
use regex::{Captures, Regex};

use super::{file_stem, read_utf8, DocumentParser, ParsedDocument, Segment};

/// Plain text. The whole file is one segment titled by the file stem.
pub struct TextParser;

impl DocumentParser for TextParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        Ok(ParsedDocument {
            title: file_stem(path),
            author: None,
        })
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>> {
        Ok(single_segment(&read_utf8(path)?))
    }
}

fn single_segment(text: &str) -> Vec<Segment> {
    let text = text.trim();
    if text.is_empty() {
        Vec::new()
    } else {
        vec![Segment::plain(text)]
    }
}

// ============ Markdown ============

/// Markdown split into one segment per heading.
///
/// The heading text becomes the segment's chapter; the heading line itself
/// is not part of the body. Headings inside fenced code blocks are ignored.
/// YAML front matter is stripped and may supply `title` and `author`.
pub struct MarkdownParser;

struct FrontMatter<'a> {
    title: Option<String>,
    author: Option<String>,
    body: &'a str,
}

fn split_front_matter(text: &str) -> FrontMatter<'_> {
    let none = FrontMatter {
        title: None,
        author: None,
        body: text,
    };
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return none;
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return FrontMatter {
                title: front_matter_field(header, "title"),
                author: front_matter_field(header, "author"),
                body,
            };
        }
        offset += line.len();
    }
    none
}

fn front_matter_field(header: &str, key: &str) -> Option<String> {
    header.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let v = v.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        (!v.is_empty()).then(|| v.to_string())
    })
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

/// Returns the heading text when `line` is an ATX heading.
fn atx_heading(line: &str) -> Option<(usize, &str)> {
    let level = line.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    let text = rest.trim().trim_end_matches('#').trim();
    (!text.is_empty()).then_some((level, text))
}

fn markdown_title(body: &str) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();
    let mut in_fence = false;
    let mut setext = None;
    for (i, line) in lines.iter().enumerate() {
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some((1, text)) = atx_heading(line) {
            return Some(text.to_string());
        }
        if setext.is_none() && i > 0 {
            let underline = line.trim();
            let prev = lines[i - 1].trim();
            if !underline.is_empty() && underline.chars().all(|c| c == '=') && !prev.is_empty() {
                setext = Some(prev.to_string());
            }
        }
    }
    setext
}

fn markdown_sections(body: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut chapter: Option<String> = None;
    let mut current = String::new();
    let mut in_fence = false;

    let mut flush = |chapter: &Option<String>, current: &mut String| {
        let text = current.trim();
        if !text.is_empty() {
            segments.push(Segment {
                text: text.to_string(),
                page_number: None,
                chapter: chapter.clone(),
            });
        }
        current.clear();
    };

    for line in body.lines() {
        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence {
            if let Some((_, heading)) = atx_heading(line) {
                flush(&chapter, &mut current);
                chapter = Some(heading.to_string());
                continue;
            }
        }
        current.push_str(line);
        current.push('\n');
    }
    flush(&chapter, &mut current);
    segments
}

impl DocumentParser for MarkdownParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let text = read_utf8(path)?;
        let front = split_front_matter(&text);
        let title = front
            .title
            .or_else(|| markdown_title(front.body))
            .unwrap_or_else(|| file_stem(path));
        Ok(ParsedDocument {
            title,
            author: front.author,
        })
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>> {
        let text = read_utf8(path)?;
        Ok(markdown_sections(split_front_matter(&text).body))
    }
}

// ============ reStructuredText ============

/// reStructuredText as one segment. The title is the first underlined (or
/// over- and underlined) heading; `:Author:` supplies the author.
pub struct RstParser;

fn is_adornment(line: &str) -> bool {
    let line = line.trim_end();
    let mut chars = line.chars();
    match chars.next() {
        Some(first) if first.is_ascii_punctuation() => {
            line.len() >= 3 && chars.all(|c| c == first)
        }
        _ => false,
    }
}

fn rst_title(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let candidate = line.trim();
        if candidate.is_empty() || is_adornment(line) {
            continue;
        }
        let Some(next) = lines.get(i + 1) else {
            break;
        };
        if is_adornment(next) && next.trim_end().len() >= candidate.len() {
            return Some(candidate.to_string());
        }
    }
    None
}

fn rst_author(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let value = line.trim().strip_prefix(":Author:")?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

impl DocumentParser for RstParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let text = read_utf8(path)?;
        Ok(ParsedDocument {
            title: rst_title(&text).unwrap_or_else(|| file_stem(path)),
            author: rst_author(&text),
        })
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>> {
        Ok(single_segment(&read_utf8(path)?))
    }
}

// ============ HTML ============

/// HTML reduced to text as one segment.
///
/// Scripts, styles, navigation and footers are dropped. `<pre>` blocks are
/// kept as fenced code so the chunker keeps them whole.
pub struct HtmlParser;

const DROPPED_ELEMENTS: &[&str] = &["script", "style", "nav", "footer"];

fn strip_tags(html: &str) -> Result<String> {
    let tag = Regex::new(r"<[^>]*>")?;
    Ok(tag.replace_all(html, "").into_owned())
}

pub(crate) fn decode_entities(text: &str) -> Result<String> {
    let numeric = Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);")?;
    let decoded = numeric.replace_all(text, |caps: &Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    Ok(decoded
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&"))
}

fn html_to_text(html: &str) -> Result<String> {
    let mut text = html.to_string();
    for element in DROPPED_ELEMENTS {
        let re = Regex::new(&format!(r"(?is)<{element}\b[^>]*>.*?</{element}\s*>"))?;
        text = re.replace_all(&text, "").into_owned();
    }

    let pre = Regex::new(r"(?is)<pre\b[^>]*>(.*?)</pre\s*>")?;
    let mut fenced = String::with_capacity(text.len());
    let mut last = 0;
    for caps in pre.captures_iter(&text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        fenced.push_str(&text[last..whole.start()]);
        let code = strip_tags(inner.as_str())?;
        fenced.push_str("\n```\n");
        fenced.push_str(code.trim_matches('\n'));
        fenced.push_str("\n```\n");
        last = whole.end();
    }
    fenced.push_str(&text[last..]);

    let blocks = Regex::new(
        r"(?i)</?(p|div|br|h[1-6]|li|ul|ol|tr|table|section|article|blockquote|header|main)\b[^>]*>",
    )?;
    let text = blocks.replace_all(&fenced, "\n");
    let text = decode_entities(&strip_tags(&text)?)?;

    let mut out = String::with_capacity(text.len());
    let mut blank = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank += 1;
            if blank > 1 {
                continue;
            }
        } else {
            blank = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    Ok(out.trim().to_string())
}

fn html_title(html: &str) -> Result<Option<String>> {
    for pattern in [r"(?is)<title\b[^>]*>(.*?)</title\s*>", r"(?is)<h1\b[^>]*>(.*?)</h1\s*>"] {
        let re = Regex::new(pattern)?;
        if let Some(caps) = re.captures(html) {
            let title = decode_entities(strip_tags(&caps[1])?.trim())?;
            if !title.is_empty() {
                return Ok(Some(title));
            }
        }
    }
    Ok(None)
}

fn html_author(html: &str) -> Result<Option<String>> {
    let meta = Regex::new(r#"(?is)<meta\b[^>]*\bname\s*=\s*["']author["'][^>]*>"#)?;
    let content = Regex::new(r#"(?is)\bcontent\s*=\s*["']([^"']*)["']"#)?;
    let Some(tag) = meta.find(html) else {
        return Ok(None);
    };
    match content.captures(tag.as_str()) {
        Some(caps) => {
            let author = decode_entities(caps[1].trim())?;
            Ok((!author.is_empty()).then_some(author))
        }
        None => Ok(None),
    }
}

impl DocumentParser for HtmlParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let html = read_utf8(path)?;
        Ok(ParsedDocument {
            title: html_title(&html)?.unwrap_or_else(|| file_stem(path)),
            author: html_author(&html)?,
        })
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>> {
        let html = read_utf8(path)?;
        Ok(single_segment(&html_to_text(&html)?))
    }
}
