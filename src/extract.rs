//! Structural extraction: source file → ordered sections.
//!
//! Supported formats: `.txt`, `.md`, `.docx`, `.pptx`, `.xlsx`, `.pdf`.
//! Tables are flattened to `cell | cell` rows, one row per line. Embedded
//! media (drawings, pictures, OLE objects) is skipped and media parts of the
//! package are never read.
//!
//! Extraction is deterministic: the same bytes always yield the same
//! sections in the same order, which is what lets a retry address sections
//! by position.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

use crate::models::SectionKind;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSection {
    /// 1-based position within the document.
    pub position: i64,
    pub kind: SectionKind,
    pub text: String,
    /// Source page when the format knows it (PDF).
    pub page: Option<i64>,
}

impl ExtractedSection {
    pub fn content_hash(&self) -> String {
        hex::encode(Sha256::digest(self.text.as_bytes()))
    }

    pub fn preview(&self) -> String {
        let flat = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        flat.chars().take(PREVIEW_CHARS).collect()
    }
}

/// Accumulates sections and assigns positions.
#[derive(Default)]
struct SectionSink {
    sections: Vec<ExtractedSection>,
}

impl SectionSink {
    fn push(&mut self, kind: SectionKind, text: &str, page: Option<i64>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.sections.push(ExtractedSection {
            position: self.sections.len() as i64 + 1,
            kind,
            text: text.to_string(),
            page,
        });
    }
}

pub fn extract_sections(path: &Path) -> Result<Vec<ExtractedSection>, ExtractError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let bytes = std::fs::read(path)?;
    extract_bytes(&bytes, &extension)
}

pub fn extract_bytes(bytes: &[u8], extension: &str) -> Result<Vec<ExtractedSection>, ExtractError> {
    let mut sink = SectionSink::default();
    match extension {
        "txt" | "md" | "markdown" => {
            let text = String::from_utf8_lossy(bytes);
            extract_plain(&text, None, &mut sink);
        }
        "docx" => extract_docx(bytes, &mut sink)?,
        "pptx" => extract_pptx(bytes, &mut sink)?,
        "xlsx" => extract_xlsx(bytes, &mut sink)?,
        "pdf" => extract_pdf(bytes, &mut sink)?,
        other => return Err(ExtractError::UnsupportedFormat(other.to_string())),
    }
    Ok(sink.sections)
}

// ============ Plain text / Markdown ============

fn extract_plain(text: &str, page: Option<i64>, sink: &mut SectionSink) {
    let normalized = text.replace("\r\n", "\n");
    for block in normalized.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if let Some(rest) = block.strip_prefix('#') {
            // Heading line, possibly followed by body text in the same block.
            let (heading, body) = rest.split_once('\n').unwrap_or((rest, ""));
            sink.push(SectionKind::Heading, heading.trim_start_matches('#'), page);
            sink.push(classify_block(body), body, page);
        } else {
            sink.push(classify_block(block), block, page);
        }
    }
}

fn classify_block(block: &str) -> SectionKind {
    let first = block.trim_start();
    if first.starts_with('|') {
        SectionKind::Table
    } else if first.starts_with("- ")
        || first.starts_with("* ")
        || first
            .split_once(". ")
            .map(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    {
        SectionKind::ListItem
    } else {
        SectionKind::Paragraph
    }
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8], sink: &mut SectionSink) -> Result<(), ExtractError> {
    // pdf-extract panics on some malformed inputs instead of returning Err.
    let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::Pdf("malformed PDF (parser panicked)".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let pages: Vec<&str> = text.split('\x0c').collect();
    let paged = pages.len() > 1;
    for (i, page_text) in pages.iter().enumerate() {
        let page = paged.then_some(i as i64 + 1);
        extract_plain(page_text, page, sink);
    }
    Ok(())
}

// ============ OOXML ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Numbered parts (`slide3.xml`, `sheet12.xml`) sorted numerically.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        (a.key.local_name().as_ref() == local)
            .then(|| String::from_utf8_lossy(a.value.as_ref()).into_owned())
    })
}

/// Paragraph/table walker shared by WordprocessingML (`w:`) and
/// DrawingML (`a:`); both use the local names `p`, `t`, `tbl`, `tr`, `tc`.
#[derive(Default)]
struct BlockWalker {
    /// Depth inside skipped media elements.
    skip_depth: usize,
    table_depth: usize,
    in_text: bool,
    paragraph: String,
    paragraph_kind: Option<SectionKind>,
    /// pptx: paragraphs of a title placeholder shape are headings.
    shape_is_title: bool,
    cell: String,
    row: Vec<String>,
    rows: Vec<String>,
}

impl BlockWalker {
    fn is_media(name: &[u8]) -> bool {
        matches!(name, b"drawing" | b"pict" | b"object" | b"pic")
    }

    fn start(&mut self, e: &BytesStart<'_>, empty: bool) {
        let name = e.local_name();
        let name = name.as_ref();
        if self.skip_depth > 0 || Self::is_media(name) {
            if !empty {
                self.skip_depth += 1;
            }
            return;
        }
        match name {
            b"sp" => self.shape_is_title = false,
            b"ph" => {
                if let Some(kind) = attr_value(e, b"type") {
                    self.shape_is_title = kind == "title" || kind == "ctrTitle";
                }
            }
            b"tbl" if !empty => {
                self.table_depth += 1;
                if self.table_depth == 1 {
                    self.rows.clear();
                }
            }
            b"tr" if self.table_depth == 1 => self.row.clear(),
            b"tc" if self.table_depth == 1 => self.cell.clear(),
            b"p" if self.table_depth == 0 && !empty => {
                self.paragraph.clear();
                self.paragraph_kind = None;
            }
            b"pStyle" => {
                if let Some(style) = attr_value(e, b"val") {
                    if style.starts_with("Heading") || style == "Title" {
                        self.paragraph_kind = Some(SectionKind::Heading);
                    } else if style.starts_with("List") {
                        self.paragraph_kind = Some(SectionKind::ListItem);
                    }
                }
            }
            b"numPr" if self.paragraph_kind.is_none() => {
                self.paragraph_kind = Some(SectionKind::ListItem)
            }
            b"t" if !empty => self.in_text = true,
            b"tab" => self.push_text("\t"),
            b"br" => self.push_text("\n"),
            _ => {}
        }
    }

    fn end(&mut self, local: &[u8], sink: &mut SectionSink) {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }
        match local {
            b"t" => self.in_text = false,
            b"p" if self.table_depth == 0 => {
                let kind = if self.shape_is_title {
                    SectionKind::Heading
                } else {
                    self.paragraph_kind.unwrap_or(SectionKind::Paragraph)
                };
                sink.push(kind, &self.paragraph, None);
                self.paragraph.clear();
            }
            b"p" => self.cell.push(' '),
            b"tc" if self.table_depth == 1 => {
                let cell = self.cell.split_whitespace().collect::<Vec<_>>().join(" ");
                self.row.push(cell);
            }
            b"tr" if self.table_depth == 1 => {
                if self.row.iter().any(|c| !c.is_empty()) {
                    self.rows.push(self.row.join(" | "));
                }
            }
            b"tbl" => {
                self.table_depth = self.table_depth.saturating_sub(1);
                if self.table_depth == 0 {
                    sink.push(SectionKind::Table, &self.rows.join("\n"), None);
                    self.rows.clear();
                }
            }
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.skip_depth > 0 {
            return;
        }
        if self.table_depth > 0 {
            self.cell.push_str(text);
        } else {
            self.paragraph.push_str(text);
        }
    }

    fn run(mut self, xml: &[u8], sink: &mut SectionSink) -> Result<(), ExtractError> {
        let mut reader = quick_xml::Reader::from_reader(xml);
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => self.start(&e, false),
                Ok(Event::Empty(e)) => self.start(&e, true),
                Ok(Event::End(e)) => self.end(e.local_name().as_ref(), sink),
                Ok(Event::Text(te)) if self.in_text => {
                    let text = te.unescape().unwrap_or_default();
                    self.push_text(&text);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
                _ => {}
            }
            buf.clear();
        }
        Ok(())
    }
}

fn extract_docx(bytes: &[u8], sink: &mut SectionSink) -> Result<(), ExtractError> {
    let mut archive = open_archive(bytes)?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    BlockWalker::default().run(&doc_xml, sink)
}

fn extract_pptx(bytes: &[u8], sink: &mut SectionSink) -> Result<(), ExtractError> {
    let mut archive = open_archive(bytes)?;
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        BlockWalker::default().run(&xml, sink)?;
    }
    Ok(())
}

fn extract_xlsx(bytes: &[u8], sink: &mut SectionSink) -> Result<(), ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let rows = extract_sheet_rows(&sheet_xml, &shared_strings)?;
        sink.push(SectionKind::Table, &rows.join("\n"), None);
    }
    Ok(())
}

/// Shared string table; rich-text runs inside one `si` are concatenated.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cell_type: Option<String> = None;
    let mut in_value = false;
    let mut value = String::new();
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_type = attr_value(&e, b"t");
                    value.clear();
                }
                // `v` for stored values, `t` for inline strings
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => value.push_str(&te.unescape().unwrap_or_default()),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let raw = value.trim();
                    let cell = match cell_type.as_deref() {
                        Some("s") => raw
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned())
                            .unwrap_or_default(),
                        _ => raw.to_string(),
                    };
                    if !cell.is_empty() {
                        row.push(cell);
                        cell_count += 1;
                    }
                }
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
