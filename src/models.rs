//! Core data models used throughout the retrieval pipeline.
//!
//! These types represent the uploaded files, extracted documents, and
//! chunks that flow through ingestion and retrieval.

use serde_json::{Map, Value};

/// Free-form document metadata: string keys to JSON values.
pub type Metadata = Map<String, Value>;

/// A file attached to a chat turn, read fully into memory at the
/// request boundary. Consumed by the ingestion pipeline and not
/// persisted beyond object storage.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content: Vec<u8>,
    /// Declared MIME type (e.g. `"application/pdf"`).
    pub media_type: String,
}

/// Raw text produced by a format-specific extraction routine, before
/// chunking. A single file may yield several (one per PDF page, CSV
/// row, or spreadsheet sheet).
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub text: String,
    pub metadata: Metadata,
}

/// A bounded-size slice of a source document's text.
///
/// Metadata starts as a verbatim copy of the source document's and is
/// enriched with provenance (`conversation_id`, `message_id`, `user_id`)
/// and a per-file `order` before indexing.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub metadata: Metadata,
}

/// A chunk paired with its similarity score from a vector search.
///
/// Scores are in `[0, 1]`, higher = more relevant.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Identifiers tying a stored object to the chat turn that uploaded it.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub conversation_id: String,
    pub message_id: String,
}

/// Keep only files with a non-empty filename and a non-empty declared
/// media type. Everything else is treated as absent.
pub fn filter_valid_files(files: Vec<UploadedFile>) -> Vec<UploadedFile> {
    files
        .into_iter()
        .filter(|file| !file.filename.is_empty() && !file.media_type.is_empty())
        .collect()
}
