//! EPUB extraction: container, OPF package, then spine documents in order.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

use super::markup::decode_entities;
use super::{file_stem, DocumentParser, ParsedDocument, Segment};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Elements whose end starts a new line in the extracted text.
const BLOCK_ELEMENTS: &[&[u8]] = &[
    b"p", b"div", b"br", b"h1", b"h2", b"h3", b"h4", b"h5", b"h6", b"li", b"tr", b"pre",
    b"blockquote", b"section", b"title",
];

/// One segment per spine document; the chapter label is the document's
/// first `h1`-`h3`, else `Chapter N`.
pub struct EpubParser;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

struct Package {
    title: Option<String>,
    author: Option<String>,
    /// Archive paths of the spine documents, in reading order.
    spine: Vec<String>,
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .with_context(|| format!("EPUB entry {} not found", name))?;
    let mut out = Vec::new();
    entry.take(MAX_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        bail!("EPUB entry {} exceeds size limit ({} bytes)", name, MAX_ENTRY_BYTES);
    }
    Ok(out)
}

fn xml_reader(xml: &[u8]) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().check_end_names = false;
    reader
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    match e.try_get_attribute(name)? {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn text_of(te: &quick_xml::events::BytesText<'_>) -> Result<String> {
    match te.unescape() {
        Ok(text) => Ok(text.into_owned()),
        // XHTML named entities such as &nbsp; are unknown to the XML reader.
        Err(_) => decode_entities(&String::from_utf8_lossy(te)),
    }
}

fn rootfile_path(container: &[u8]) -> Result<String> {
    let mut reader = xml_reader(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attribute(&e, b"full-path")? {
                    return Ok(path);
                }
            }
            Event::Eof => bail!("container.xml has no rootfile"),
            _ => {}
        }
        buf.clear();
    }
}

/// Joins an href onto the OPF directory, resolving `.` and `..`.
fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

fn read_package(opf: &[u8], opf_path: &str) -> Result<Package> {
    let base_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let mut reader = xml_reader(opf);
    let mut buf = Vec::new();

    let mut title = None;
    let mut author = None;
    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut itemrefs = Vec::new();
    let mut capture: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"title" if title.is_none() => capture = Some("title"),
                b"creator" if author.is_none() => capture = Some("creator"),
                b"item" => {
                    if let (Some(id), Some(href)) = (attribute(&e, b"id")?, attribute(&e, b"href")?) {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => itemrefs.extend(attribute(&e, b"idref")?),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attribute(&e, b"id")?, attribute(&e, b"href")?) {
                        manifest.insert(id, href);
                    }
                }
                b"itemref" => itemrefs.extend(attribute(&e, b"idref")?),
                _ => {}
            },
            Event::Text(te) => {
                if let Some(field) = capture.take() {
                    let value = text_of(&te)?.trim().to_string();
                    if !value.is_empty() {
                        match field {
                            "title" => title = Some(value),
                            _ => author = Some(value),
                        }
                    }
                }
            }
            Event::End(_) => capture = None,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let spine = itemrefs
        .iter()
        .filter_map(|idref| manifest.get(idref))
        .map(|href| resolve_href(base_dir, href))
        .collect();

    Ok(Package {
        title,
        author,
        spine,
    })
}

/// Flattens an XHTML document to text and returns its first `h1`-`h3`.
fn xhtml_to_text(xml: &[u8]) -> Result<(String, Option<String>)> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut heading: Option<String> = None;
    let mut heading_buf: Option<String> = None;
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"script" | b"style" | b"head" => skip_depth += 1,
                b"h1" | b"h2" | b"h3" if heading.is_none() && skip_depth == 0 => {
                    heading_buf = Some(String::new());
                }
                _ => {}
            },
            Event::End(e) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"script" | b"style" | b"head" => skip_depth = skip_depth.saturating_sub(1),
                    b"h1" | b"h2" | b"h3" => {
                        if let Some(text) = heading_buf.take() {
                            let text = text.trim();
                            if !text.is_empty() {
                                heading = Some(text.to_string());
                            }
                        }
                    }
                    _ => {}
                }
                if skip_depth == 0 && BLOCK_ELEMENTS.contains(&name.as_ref()) {
                    end_line(&mut out);
                }
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"br" {
                    end_line(&mut out);
                }
            }
            Event::Text(te) if skip_depth == 0 => {
                let text = text_of(&te)?;
                append_text(&mut out, &text);
                if let Some(h) = heading_buf.as_mut() {
                    append_text(h, &text);
                }
            }
            Event::CData(cd) if skip_depth == 0 => {
                append_text(&mut out, &String::from_utf8_lossy(&cd));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok((out.trim().to_string(), heading))
}

/// Appends text with whitespace runs collapsed to one space.
fn append_text(out: &mut String, text: &str) {
    for c in text.chars() {
        if c.is_whitespace() {
            if !out.is_empty() && !out.ends_with(' ') && !out.ends_with('\n') {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
}

fn end_line(out: &mut String) {
    let trimmed = out.trim_end_matches(' ').len();
    out.truncate(trimmed);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn open_package(archive: &mut Archive<'_>) -> Result<Package> {
    let container = read_entry(archive, CONTAINER_PATH)?;
    let opf_path = rootfile_path(&container)?;
    let opf = read_entry(archive, &opf_path)?;
    read_package(&opf, &opf_path)
}

fn parse_bytes(bytes: &[u8]) -> Result<Package> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| anyhow!("not an EPUB archive: {}", e))?;
    open_package(&mut archive)
}

fn extract_bytes(bytes: &[u8]) -> Result<Vec<Segment>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| anyhow!("not an EPUB archive: {}", e))?;
    let package = open_package(&mut archive)?;

    let mut segments = Vec::new();
    for path in &package.spine {
        let xhtml = read_entry(&mut archive, path)?;
        let (text, heading) =
            xhtml_to_text(&xhtml).with_context(|| format!("Failed to read {}", path))?;
        if text.is_empty() {
            continue;
        }
        let chapter = heading.unwrap_or_else(|| format!("Chapter {}", segments.len() + 1));
        segments.push(Segment {
            text,
            page_number: None,
            chapter: Some(chapter),
        });
    }
    Ok(segments)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

impl DocumentParser for EpubParser {
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let package = parse_bytes(&read_file(path)?)?;
        Ok(ParsedDocument {
            title: package.title.unwrap_or_else(|| file_stem(path)),
            author: package.author,
        })
    }

    fn extract_text(&self, path: &Path) -> Result<Vec<Segment>> {
        extract_bytes(&read_file(path)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Builds a minimal EPUB with the given (file name, xhtml body) chapters.
    pub(crate) fn build_epub(title: &str, author: &str, chapters: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        writer.start_file("mimetype", options).unwrap();
        writer.write_all(b"application/epub+zip").unwrap();

        writer.start_file(CONTAINER_PATH, options).unwrap();
        writer
            .write_all(
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
            )
            .unwrap();

        let mut manifest = String::new();
        let mut spine = String::new();
        for (i, (name, _)) in chapters.iter().enumerate() {
            manifest.push_str(&format!(
                r#"<item id="c{i}" href="text/{name}" media-type="application/xhtml+xml"/>"#
            ));
            spine.push_str(&format!(r#"<itemref idref="c{i}"/>"#));
        }
        let opf = format!(
            r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{title}</dc:title>
    <dc:creator>{author}</dc:creator>
  </metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
        );
        writer.start_file("OEBPS/content.opf", options).unwrap();
        writer.write_all(opf.as_bytes()).unwrap();

        for (name, body) in chapters {
            writer
                .start_file(format!("OEBPS/text/{name}"), options)
                .unwrap();
            let xhtml = format!(
                r#"<?xml version="1.0"?><html xmlns="http://www.w3.org/1999/xhtml"><head><title>ignored</title><style>p {{}}</style></head><body>{body}</body></html>"#
            );
            writer.write_all(xhtml.as_bytes()).unwrap();
        }

        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_epub_metadata_and_spine_order() {
        let bytes = build_epub(
            "The Book",
            "A. Writer",
            &[
                ("one.xhtml", "<h1>Beginnings</h1><p>First <em>words</em>.</p>"),
                ("blank.xhtml", "<p>   </p>"),
                ("two.xhtml", "<p>No heading&nbsp;here.</p><p>Second para.</p>"),
            ],
        );

        let package = parse_bytes(&bytes).unwrap();
        assert_eq!(package.title.as_deref(), Some("The Book"));
        assert_eq!(package.author.as_deref(), Some("A. Writer"));
        assert_eq!(package.spine[0], "OEBPS/text/one.xhtml");

        let segments = extract_bytes(&bytes).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].chapter.as_deref(), Some("Beginnings"));
        assert_eq!(segments[0].text, "Beginnings\nFirst words.");
        assert!(!segments[0].text.contains("ignored"));
        assert_eq!(segments[1].chapter.as_deref(), Some("Chapter 2"));
        assert_eq!(segments[1].text, "No heading here.\nSecond para.");
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(resolve_href("OEBPS", "text/a.xhtml#frag"), "OEBPS/text/a.xhtml");
        assert_eq!(resolve_href("OEBPS/sub", "../a.xhtml"), "OEBPS/a.xhtml");
        assert_eq!(resolve_href("", "a.xhtml"), "a.xhtml");
    }

    #[test]
    fn test_invalid_zip_returns_error() {
        assert!(extract_bytes(b"not a zip").is_err());
    }
}
