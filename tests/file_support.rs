//! Per-format ingestion through the CLI: PDF, DOCX, XLSX, corrupt input
//! and the upload size limit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn reportminer_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("reportminer");
    path
}

/// Minimal valid PDF containing the text "quarterly revenue summary".
/// Offsets in the xref table are computed from the body so pdf-extract can parse it.
fn minimal_pdf() -> Vec<u8> {
    let stream = b"BT /F1 12 Tf 100 700 Td (quarterly revenue summary) Tj ET";
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(format!("4 0 obj << /Length {} >> stream\n", stream.len()).as_bytes());
    out.extend_from_slice(stream);
    out.extend_from_slice(b"\nendstream endobj\n");
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

fn zip_of(entries: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// DOCX with a heading, a paragraph and a two-row table.
fn minimal_docx() -> Vec<u8> {
    let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Operations Review</w:t></w:r></w:p>
<w:p><w:r><w:t>Customer satisfaction improved across every region.</w:t></w:r></w:p>
<w:tbl>
<w:tr><w:tc><w:p><w:r><w:t>Metric</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Value</w:t></w:r></w:p></w:tc></w:tr>
<w:tr><w:tc><w:p><w:r><w:t>Uptime</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>99.9%</w:t></w:r></w:p></w:tc></w:tr>
</w:tbl>
</w:body></w:document>"#;
    zip_of(&[("word/document.xml", xml.to_string())])
}

/// XLSX with one sheet using shared strings for text cells.
fn minimal_xlsx() -> Vec<u8> {
    let workbook = r#"<?xml version="1.0"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheets><sheet name="Budget" sheetId="1"/></sheets></workbook>"#;
    let shared = r#"<?xml version="1.0"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><si><t>Department</t></si><si><t>Spend</t></si><si><t>Marketing</t></si><si><t>Research</t></si></sst>"#;
    let sheet = r#"<?xml version="1.0"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>
<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
<row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>5000</v></c></row>
<row r="3"><c r="A3" t="s"><v>3</v></c><c r="B3"><v>7250.5</v></c></row>
</sheetData></worksheet>"#;
    zip_of(&[
        ("xl/workbook.xml", workbook.to_string()),
        ("xl/sharedStrings.xml", shared.to_string()),
        ("xl/worksheets/sheet1.xml", sheet.to_string()),
    ])
}

fn setup_env(max_file_bytes: Option<u64>) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("files")).unwrap();

    let mut config_content = format!(
        r#"[db]
path = "{}/data/reportminer.sqlite"

[embedding]
provider = "local"
model = "hash-embed-v1"
dims = 64

[generation]
provider = "disabled"
"#,
        root.display()
    );
    if let Some(limit) = max_file_bytes {
        config_content.push_str(&format!("\n[ingest]\nmax_file_bytes = {}\n", limit));
    }

    let config_path = root.join("config/reportminer.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_reportminer(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = reportminer_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run reportminer binary at {:?}: {}", binary, e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn ingest_file(config: &Path, dir: &Path, name: &str, bytes: &[u8]) -> (String, String, bool) {
    let path = dir.join("files").join(name);
    fs::write(&path, bytes).unwrap();
    run_reportminer(config, &["ingest", path.to_str().unwrap()])
}

fn status_of(config: &Path, ingest_stdout: &str) -> String {
    let id = ingest_stdout
        .lines()
        .find(|l| l.starts_with("  "))
        .and_then(|l| l.split_whitespace().next())
        .unwrap()
        .to_string();
    let (stdout, _, success) = run_reportminer(config, &["status", &id]);
    assert!(success);
    stdout
}

#[test]
fn pdf_is_extracted_and_indexed() {
    let (tmp, config) = setup_env(None);
    let (stdout, stderr, success) = ingest_file(&config, tmp.path(), "q3.pdf", &minimal_pdf());
    assert!(success, "pdf ingest failed: {}", stderr);
    assert!(stdout.contains("completed"));

    let status = status_of(&config, &stdout);
    assert!(status.contains("file_type:    pdf"));
    assert!(status.contains("[indexing] succeeded"));
}

#[test]
fn docx_paragraphs_and_tables_are_extracted() {
    let (tmp, config) = setup_env(None);
    let (stdout, stderr, success) =
        ingest_file(&config, tmp.path(), "review.docx", &minimal_docx());
    assert!(success, "docx ingest failed: {}", stderr);
    assert!(stdout.contains("completed"));

    let status = status_of(&config, &stdout);
    assert!(status.contains("3 segments, 1 tables"));
}

#[test]
fn xlsx_rows_are_extracted() {
    let (tmp, config) = setup_env(None);
    let (stdout, stderr, success) =
        ingest_file(&config, tmp.path(), "budget.xlsx", &minimal_xlsx());
    assert!(success, "xlsx ingest failed: {}", stderr);
    assert!(stdout.contains("completed"));

    let status = status_of(&config, &stdout);
    assert!(status.contains("2 segments, 1 tables"));
}

#[test]
fn corrupt_pdf_fails_at_extraction() {
    let (tmp, config) = setup_env(None);
    let (stdout, _, success) =
        ingest_file(&config, tmp.path(), "broken.pdf", b"this is not a pdf");
    assert!(!success);
    assert!(stdout.contains("failed at extraction"));

    let status = status_of(&config, &stdout);
    assert!(status.contains("status:       failed"));
    assert!(status.contains("[extraction] failed"));
}

#[test]
fn corrupt_docx_fails_at_extraction() {
    let (tmp, config) = setup_env(None);
    let (stdout, _, success) = ingest_file(&config, tmp.path(), "broken.docx", b"PK not a zip");
    assert!(!success);
    assert!(stdout.contains("failed at extraction"));
}

#[test]
fn oversized_upload_fails() {
    let (tmp, config) = setup_env(Some(32));
    let body = "A report line that is comfortably longer than thirty-two bytes.\n";
    let (stdout, _, success) = ingest_file(&config, tmp.path(), "long.txt", body.as_bytes());
    assert!(!success);
    assert!(stdout.contains("failed at extraction"));
    assert!(stdout.contains("limit is 32 bytes"));
}

#[test]
fn empty_text_is_routed_to_review() {
    let (tmp, config) = setup_env(None);
    let (stdout, stderr, success) = ingest_file(&config, tmp.path(), "blank.txt", b"  \n\n  \n");
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("requires review"));

    let status = status_of(&config, &stdout);
    assert!(status.contains("status:       requires_review"));
}
