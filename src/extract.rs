//! Multi-format content extraction for uploaded reports.
//!
//! Turns raw bytes of a PDF, DOCX, XLSX, CSV or TXT file into ordered
//! [`TextSegment`]s plus any [`StructuredTable`]s and [`KeyValue`] pairs
//! found along the way. Extraction is pure: the same bytes always produce
//! the same output, which the ingestion pipeline relies on for idempotent
//! re-processing.
//!
//! # Segment rules
//!
//! | Format | Segments |
//! |--------|----------|
//! | pdf, txt | blank-line separated blocks, classified by shape; pipe/tab blocks become tables |
//! | docx | one per `w:p` paragraph (heading styles honoured); `w:tbl` rows become table rows |
//! | xlsx, csv | one `TableRow` per data row, rendered as `Header: value; ...` |
//!
//! A syntactically valid file that yields no segments returns an empty
//! [`Extraction`]; callers decide what to do with it.

use std::io::Read;
use std::sync::OnceLock;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{FileType, KeyValue, SegmentKind, StructuredTable, TextSegment};
use crate::structured;

/// Workbooks with more sheets are rejected.
const XLSX_MAX_SHEETS: usize = 100;
/// Sheets with more non-empty cells are rejected.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Spreadsheet column limit of the OOXML format.
const XLSX_MAX_COLUMNS: usize = 16_384;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Everything extracted from one document.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub segments: Vec<TextSegment>,
    pub tables: Vec<StructuredTable>,
    pub key_values: Vec<KeyValue>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Extract segments, tables and key/value pairs from `bytes`.
///
/// Fails with [`Error::Extraction`] for empty, oversized, corrupt or
/// undecodable input. Never panics on malformed files.
pub fn extract(
    document_id: &str,
    file_type: FileType,
    bytes: &[u8],
    max_file_bytes: u64,
) -> Result<Extraction> {
    if bytes.is_empty() {
        return Err(Error::extraction(file_type, "input is empty"));
    }
    if bytes.len() as u64 > max_file_bytes {
        return Err(Error::extraction(
            file_type,
            format!(
                "input is {} bytes, limit is {} bytes",
                bytes.len(),
                max_file_bytes
            ),
        ));
    }

    let mut builder = Builder::new(document_id);
    let result = match file_type {
        FileType::Pdf => extract_pdf(&mut builder, bytes),
        FileType::Docx => extract_docx(&mut builder, bytes),
        FileType::Xlsx => extract_xlsx(&mut builder, bytes),
        FileType::Csv => extract_csv(&mut builder, bytes),
        FileType::Txt => {
            let text = String::from_utf8_lossy(bytes);
            builder.push_prose(text.trim_start_matches('\u{feff}'), None);
            Ok(())
        }
    };
    result.map_err(|reason| Error::extraction(file_type, reason))?;
    Ok(builder.out)
}

fn page_footer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i:page)\s+\d+(?:\s+of\s+\d+)?$").expect("static regex"))
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accumulates segments with dense, 1-based sequence numbers.
struct Builder<'a> {
    document_id: &'a str,
    out: Extraction,
}

impl<'a> Builder<'a> {
    fn new(document_id: &'a str) -> Self {
        Self {
            document_id,
            out: Extraction::default(),
        }
    }

    fn push(&mut self, page: Option<u32>, kind: SegmentKind, content: String) {
        if content.is_empty() {
            return;
        }
        let sequence = self.out.segments.len() as i64 + 1;
        self.out.segments.push(TextSegment::new(
            self.document_id,
            sequence,
            page,
            kind,
            content,
        ));
    }

    /// Split free text into blank-line separated blocks.
    fn push_prose(&mut self, text: &str, page: Option<u32>) {
        let mut block: Vec<&str> = Vec::new();
        for line in text.lines().chain(std::iter::once("")) {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                if !block.is_empty() {
                    self.push_block(&block, page);
                    block.clear();
                }
            } else if !page_footer_re().is_match(trimmed) {
                block.push(line);
            }
        }
    }

    fn push_block(&mut self, lines: &[&str], page: Option<u32>) {
        if let Some((headers, rows)) = structured::parse_delimited_block(lines) {
            let name = format!("Table_{}", self.out.tables.len() + 1);
            self.push_table(&name, headers, rows, page);
            return;
        }
        let raw = lines.join("\n");
        self.out
            .key_values
            .extend(structured::mine_key_values(self.document_id, &raw));
        let text = normalize(&raw);
        let kind = structured::classify_segment(&text);
        self.push(page, kind, text);
    }

    fn push_paragraph(&mut self, raw: &str, style: Option<&str>) {
        let text = normalize(raw);
        if text.is_empty() {
            return;
        }
        self.out
            .key_values
            .extend(structured::mine_key_values(self.document_id, raw));
        let style = style.map(|s| s.to_ascii_lowercase());
        let kind = match style.as_deref() {
            Some(s) if s.starts_with("heading") => SegmentKind::Heading,
            Some("title") => SegmentKind::Title,
            _ => structured::classify_segment(&text),
        };
        self.push(None, kind, text);
    }

    /// One `TableRow` segment per non-empty data row plus a typed table.
    fn push_table(
        &mut self,
        name: &str,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
        page: Option<u32>,
    ) {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
            .collect();
        if rows.is_empty() {
            return;
        }
        for row in &rows {
            let text = structured::row_text(&headers, row);
            self.push(page, SegmentKind::TableRow, text);
        }
        let ordinal = self.out.tables.len();
        let table = structured::build_table(self.document_id, ordinal, name, headers, &rows);
        self.out.tables.push(table);
    }
}

fn extract_pdf(builder: &mut Builder<'_>, bytes: &[u8]) -> std::result::Result<(), String> {
    // pdf-extract panics on some malformed inputs.
    let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| "PDF parser aborted on malformed input".to_string())?
        .map_err(|e| format!("PDF extraction failed: {}", e))?;
    for (i, page) in text.split('\u{c}').enumerate() {
        builder.push_prose(page, Some(i as u32 + 1));
    }
    Ok(())
}

fn extract_csv(builder: &mut Builder<'_>, bytes: &[u8]) -> std::result::Result<(), String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .byte_headers()
        .map_err(|e| format!("CSV header: {}", e))?
        .iter()
        .map(|h| {
            String::from_utf8_lossy(h)
                .trim_start_matches('\u{feff}')
                .trim()
                .to_string()
        })
        .collect();

    let mut rows = Vec::new();
    for (i, record) in reader.byte_records().enumerate() {
        // A malformed record fails the whole file; partial tables are not committed.
        let record = record.map_err(|e| format!("CSV row {}: {}", i + 1, e))?;
        rows.push(
            record
                .iter()
                .map(|f| String::from_utf8_lossy(f).trim().to_string())
                .collect(),
        );
    }
    builder.push_table("csv", headers, rows, None);
    Ok(())
}

type ZipArchive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> std::result::Result<ZipArchive<'_>, String> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| format!("invalid archive: {}", e))
}

fn read_zip_entry_bounded(
    archive: &mut ZipArchive<'_>,
    name: &str,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive
        .by_name(name)
        .map_err(|e| format!("{}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| format!("{}: {}", name, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        ));
    }
    Ok(out)
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn extract_docx(builder: &mut Builder<'_>, bytes: &[u8]) -> std::result::Result<(), String> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;

    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut para = String::new();
    let mut style: Option<String> = None;
    let mut in_text = false;
    let mut table_depth = 0usize;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => {
                    para.clear();
                    style = None;
                }
                b"t" => in_text = true,
                b"pStyle" => style = attr_value(&e, b"val"),
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        rows.clear();
                    }
                }
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell.clear(),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => style = attr_value(&e, b"val"),
                b"tab" => para.push('\t'),
                b"br" | b"cr" => para.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| e.to_string())?;
                para.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if table_depth > 0 {
                        let text = normalize(&para);
                        if !text.is_empty() {
                            if !cell.is_empty() {
                                cell.push(' ');
                            }
                            cell.push_str(&text);
                        }
                    } else {
                        builder.push_paragraph(&para, style.as_deref());
                    }
                    para.clear();
                }
                b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                b"tr" if table_depth == 1 => rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        push_docx_table(builder, std::mem::take(&mut rows));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("word/document.xml: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn push_docx_table(builder: &mut Builder<'_>, mut rows: Vec<Vec<String>>) {
    if rows.is_empty() {
        return;
    }
    let headers = rows.remove(0);
    if rows.is_empty() {
        // Single-row table: keep its text as prose.
        let text = normalize(&headers.join(" | "));
        builder.push(None, SegmentKind::Paragraph, text);
        return;
    }
    let name = format!("Table_{}", builder.out.tables.len() + 1);
    builder.push_table(&name, headers, rows, None);
}

fn extract_xlsx(builder: &mut Builder<'_>, bytes: &[u8]) -> std::result::Result<(), String> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let sheet_titles = if archive.file_names().any(|n| n == "xl/workbook.xml") {
        read_sheet_titles(&mut archive)?
    } else {
        Vec::new()
    };
    let sheet_files = list_worksheet_names(&archive);
    if sheet_files.is_empty() {
        return Err("workbook has no worksheets".to_string());
    }

    if sheet_files.len() > XLSX_MAX_SHEETS {
        return Err(format!(
            "workbook has {} worksheets, limit is {}",
            sheet_files.len(),
            XLSX_MAX_SHEETS
        ));
    }

    for (idx, file) in sheet_files.into_iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, &file)?;
        let mut rows = read_sheet_rows(&xml, &shared_strings).map_err(|e| format!("{}: {}", file, e))?;
        let Some(header_pos) = rows
            .iter()
            .position(|r| r.iter().any(|c| !c.trim().is_empty()))
        else {
            continue;
        };
        let data = rows.split_off(header_pos + 1);
        let headers: Vec<String> = rows
            .pop()
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();
        let name = sheet_titles
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        builder.push_table(&name, headers, data, None);
    }
    Ok(())
}

fn read_shared_strings(archive: &mut ZipArchive<'_>) -> std::result::Result<Vec<String>, String> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                current.push_str(&te.unescape().map_err(|e| e.to_string())?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("xl/sharedStrings.xml: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn read_sheet_titles(archive: &mut ZipArchive<'_>) -> std::result::Result<Vec<String>, String> {
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml")?;
    let mut titles = Vec::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                if let Some(name) = attr_value(&e, b"name") {
                    titles.push(name);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("xl/workbook.xml: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(titles)
}

fn list_worksheet_names(archive: &ZipArchive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Zero-based column index from a cell reference such as `AB12`.
///
/// `None` when the reference has no column letters or lies past the last
/// spreadsheet column (`XFD`).
fn column_index(cell_ref: &str) -> Option<usize> {
    let mut n = 0usize;
    let mut letters = 0;
    for b in cell_ref.bytes().take_while(u8::is_ascii_alphabetic) {
        letters += 1;
        if letters > 3 {
            return None;
        }
        n = n * 26 + usize::from(b.to_ascii_uppercase() - b'A' + 1);
    }
    (letters > 0 && n <= XLSX_MAX_COLUMNS).then(|| n - 1)
}

fn resolve_cell(cell_type: Option<&str>, raw: &str, shared: &[String]) -> String {
    match cell_type {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| shared.get(i).cloned())
            .unwrap_or_default(),
        Some("b") => {
            if raw.trim() == "1" {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        _ => raw.to_string(),
    }
}

fn read_sheet_rows(xml: &[u8], shared: &[String]) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cell_col = 0usize;
    let mut cell_type: Option<String> = None;
    let mut value = String::new();
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => current.clear(),
                b"c" => {
                    cell_col = match attr_value(&e, b"r") {
                        Some(r) if r.starts_with(|c: char| c.is_ascii_alphabetic()) => {
                            column_index(&r).ok_or_else(|| {
                                format!("cell {} is past the last column (XFD)", r)
                            })?
                        }
                        _ => current.len(),
                    };
                    cell_type = attr_value(&e, b"t");
                    value.clear();
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"row" => rows.push(Vec::new()),
            Ok(Event::Text(te)) if in_value => {
                value.push_str(&te.unescape().map_err(|e| e.to_string())?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let resolved = resolve_cell(cell_type.as_deref(), &value, shared);
                    if !resolved.trim().is_empty() {
                        cell_count += 1;
                        if cell_count > XLSX_MAX_CELLS_PER_SHEET {
                            return Err(format!(
                                "sheet has more than {} non-empty cells",
                                XLSX_MAX_CELLS_PER_SHEET
                            ));
                        }
                        if current.len() <= cell_col {
                            current.resize(cell_col + 1, String::new());
                        }
                        current[cell_col] = resolved;
                    }
                    value.clear();
                }
                b"row" => rows.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("worksheet: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
