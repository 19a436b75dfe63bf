//! Multi-format text extraction for uploaded files.
//!
//! The ingestion orchestrator supplies bytes + media type; this module
//! returns one or more [`ExtractedDocument`]s with source metadata
//! (filename, plus page/row/sheet position where the format has one).
//! Extraction never panics on malformed input; errors propagate and the
//! pipeline skips the file.

use std::io::Read;

use base64::Engine;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::llm;
use crate::models::{ExtractedDocument, Metadata};
use crate::object_store::ObjectStore;

/// Supported MIME types.
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_JSON: &str = "application/json";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction error. No panic on malformed input; the pipeline skips
/// the offending file.
#[derive(Debug)]
pub enum ExtractError {
    UnsupportedMediaType(String),
    Fetch(String),
    Pdf(String),
    Csv(String),
    Ooxml(String),
    Json(String),
    Ocr(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::UnsupportedMediaType(mt) => {
                write!(f, "unsupported media type: {}", mt)
            }
            ExtractError::Fetch(e) => write!(f, "object fetch failed: {}", e),
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Csv(e) => write!(f, "CSV extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
            ExtractError::Json(e) => write!(f, "JSON extraction failed: {}", e),
            ExtractError::Ocr(e) => write!(f, "image OCR failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extractor selected by media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    Pdf,
    Image,
    Tabular,
    Spreadsheet,
    Json,
}

impl Extractor {
    /// Select the extractor for a media type. Unknown types are
    /// rejected here, before any bytes are stored or fetched.
    pub fn for_media_type(media_type: &str) -> Result<Self, ExtractError> {
        match media_type {
            MIME_PDF => Ok(Extractor::Pdf),
            MIME_JPEG | MIME_PNG => Ok(Extractor::Image),
            MIME_CSV => Ok(Extractor::Tabular),
            MIME_XLSX => Ok(Extractor::Spreadsheet),
            MIME_JSON => Ok(Extractor::Json),
            other => Err(ExtractError::UnsupportedMediaType(other.to_string())),
        }
    }

    /// Extract documents from raw bytes. `filename` becomes the
    /// `source` metadata value; the chat model config is only used by
    /// the image extractor.
    pub async fn extract(
        &self,
        bytes: &[u8],
        filename: &str,
        media_type: &str,
        llm_config: &LlmConfig,
    ) -> Result<Vec<ExtractedDocument>, ExtractError> {
        match self {
            Extractor::Pdf => extract_pdf(bytes, filename),
            Extractor::Tabular => extract_csv(bytes, filename),
            Extractor::Spreadsheet => extract_xlsx(bytes, filename),
            Extractor::Json => extract_json(bytes, filename),
            Extractor::Image => extract_image(bytes, filename, media_type, llm_config).await,
        }
    }
}

/// Fetch an object's bytes and extract its documents.
pub async fn extract_document_text(
    store: &dyn ObjectStore,
    object_key: &str,
    media_type: &str,
    filename: &str,
    llm_config: &LlmConfig,
) -> Result<Vec<ExtractedDocument>, ExtractError> {
    let extractor = Extractor::for_media_type(media_type)?;
    let bytes = store
        .get_object(object_key)
        .await
        .map_err(|e| ExtractError::Fetch(e.to_string()))?;
    extractor.extract(&bytes, filename, media_type, llm_config).await
}

fn source_metadata(filename: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!(filename));
    metadata
}

// ============ PDF ============

/// One document per page, with 0-based page numbers in metadata.
fn extract_pdf(bytes: &[u8], filename: &str) -> Result<Vec<ExtractedDocument>, ExtractError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(page, text)| {
            let mut metadata = source_metadata(filename);
            metadata.insert("page".to_string(), json!(page));
            ExtractedDocument { text, metadata }
        })
        .collect())
}

// ============ CSV ============

/// One document per record, rendered as `header: value` lines, with
/// 0-based row numbers in metadata.
fn extract_csv(bytes: &[u8], filename: &str) -> Result<Vec<ExtractedDocument>, ExtractError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| ExtractError::Csv(e.to_string()))?
        .clone();

    let mut documents = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        let text = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| format!("{}: {}", header, value))
            .collect::<Vec<_>>()
            .join("\n");

        let mut metadata = source_metadata(filename);
        metadata.insert("row".to_string(), json!(row));
        documents.push(ExtractedDocument { text, metadata });
    }
    Ok(documents)
}

// ============ XLSX ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
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

/// One document per worksheet, with the sheet index in metadata.
fn extract_xlsx(bytes: &[u8], filename: &str) -> Result<Vec<ExtractedDocument>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&mut archive);

    let mut documents = Vec::new();
    for (sheet, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_sheet_cells(&sheet_xml, &shared_strings)?;

        let mut metadata = source_metadata(filename);
        metadata.insert("sheet".to_string(), json!(sheet));
        documents.push(ExtractedDocument { text, metadata });
    }
    Ok(documents)
}

/// Read `xl/sharedStrings.xml`. Workbooks holding only numeric cells
/// omit the part entirely, so a missing entry yields an empty table.
fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = match read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES) {
        Ok(xml) => xml,
        Err(_) => return Ok(Vec::new()),
    };

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
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

/// Pull cell values out of a worksheet. Shared-string cells are resolved
/// through the table; inline numeric values are kept as-is.
fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    if cell_is_shared_str {
                        if let Ok(i) = s.parse::<usize>() {
                            if i < shared_strings.len() {
                                cells.push(shared_strings[i].clone());
                            }
                        }
                    } else {
                        cells.push(s.to_string());
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

// ============ JSON ============

/// A single document rendering the whole value as flattened
/// `path: value` lines.
fn extract_json(bytes: &[u8], filename: &str) -> Result<Vec<ExtractedDocument>, ExtractError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;

    let mut lines = Vec::new();
    flatten_json(&value, "", &mut lines);

    Ok(vec![ExtractedDocument {
        text: lines.join("\n"),
        metadata: source_metadata(filename),
    }])
}

fn flatten_json(value: &Value, path: &str, lines: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten_json(child, &child_path, lines);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_json(child, &format!("{}[{}]", path, i), lines);
            }
        }
        Value::String(s) => lines.push(format!("{}: {}", path, s)),
        other => lines.push(format!("{}: {}", path, other)),
    }
}

// ============ Images ============

const OCR_PROMPT: &str =
    "Transcribe all text visible in this image. If the image contains charts, \
     tables, or diagrams, describe their content. Respond with the transcription only.";

/// One document with model-transcribed text. Requires an enabled chat
/// model; the image travels as a base64 data URL.
async fn extract_image(
    bytes: &[u8],
    filename: &str,
    media_type: &str,
    llm_config: &LlmConfig,
) -> Result<Vec<ExtractedDocument>, ExtractError> {
    if !llm_config.is_enabled() {
        return Err(ExtractError::Ocr(
            "image extraction requires an enabled llm provider".to_string(),
        ));
    }

    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let data_url = format!("data:{};base64,{}", media_type, encoded);

    let messages = json!([
        {
            "role": "user",
            "content": [
                { "type": "text", "text": OCR_PROMPT },
                { "type": "image_url", "image_url": { "url": data_url } }
            ]
        }
    ]);

    let text = llm::chat_completion(llm_config, messages)
        .await
        .map_err(|e| ExtractError::Ocr(e.to_string()))?;

    Ok(vec![ExtractedDocument {
        text,
        metadata: source_metadata(filename),
    }])
}
