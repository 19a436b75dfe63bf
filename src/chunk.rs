//! Recursive character text chunker.
//!
//! Splits extracted document text into overlapping windows bounded by
//! `chunk_size`, preferring larger semantic boundaries first: paragraph
//! (`\n\n`), then line, then word, then raw characters. Consecutive
//! chunks of the same source document share `chunk_overlap` characters
//! of repeated context.
//!
//! Splitting is a pure function over in-memory text: deterministic,
//! no error conditions, and empty input yields zero chunks. Metadata is
//! copied verbatim from the source document into every chunk derived
//! from it; provenance enrichment happens later, in the loader.

use crate::models::{Chunk, ExtractedDocument};

/// Separator hierarchy, coarsest first. The empty string is the
/// character-window fallback and always matches.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// Split each document's text into chunks, copying its metadata into
/// every chunk. Chunk order follows document order, so enumerating the
/// returned list gives a stable per-file chunk sequence.
pub fn split_documents(
    documents: &[ExtractedDocument],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for doc in documents {
        for text in split_text(&doc.text, chunk_size, chunk_overlap) {
            chunks.push(Chunk {
                text,
                metadata: doc.metadata.clone(),
            });
        }
    }
    chunks
}

/// Split text into strings of at most `chunk_size` characters with
/// `chunk_overlap` characters repeated between consecutive chunks.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    split_recursive(text, chunk_size, chunk_overlap, SEPARATORS)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_recursive(
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    separators: &[&str],
) -> Vec<String> {
    // First separator actually present in the text wins; "" always does.
    let sep_idx = separators
        .iter()
        .position(|s| s.is_empty() || text.contains(s))
        .unwrap_or(separators.len() - 1);
    let separator = separators[sep_idx];
    let remaining = &separators[sep_idx + 1..];

    let splits: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(separator).map(str::to_string).collect()
    };

    let mut finals = Vec::new();
    let mut goods: Vec<String> = Vec::new();

    for piece in splits {
        if char_len(&piece) < chunk_size {
            goods.push(piece);
        } else {
            if !goods.is_empty() {
                finals.extend(merge_splits(&goods, separator, chunk_size, chunk_overlap));
                goods.clear();
            }
            if remaining.is_empty() {
                finals.push(piece);
            } else {
                finals.extend(split_recursive(&piece, chunk_size, chunk_overlap, remaining));
            }
        }
    }

    if !goods.is_empty() {
        finals.extend(merge_splits(&goods, separator, chunk_size, chunk_overlap));
    }

    finals
}

/// Greedily pack splits into chunks of at most `chunk_size` characters,
/// rejoining with `separator`. When a chunk is emitted, splits are
/// dropped from the front of the window until at most `chunk_overlap`
/// characters remain to seed the next chunk.
fn merge_splits(
    splits: &[String],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut docs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for split in splits {
        let len = char_len(split);
        let join_len = if current.is_empty() { 0 } else { sep_len };

        if total + len + join_len > chunk_size && !current.is_empty() {
            if let Some(doc) = join_splits(&current, separator) {
                docs.push(doc);
            }
            while total > chunk_overlap
                || (total + len + if current.is_empty() { 0 } else { sep_len } > chunk_size
                    && total > 0)
            {
                let head_len = char_len(current[0]);
                total -= head_len + if current.len() > 1 { sep_len } else { 0 };
                current.remove(0);
            }
        }

        current.push(split);
        total += len + if current.len() > 1 { sep_len } else { 0 };
    }

    if let Some(doc) = join_splits(&current, separator) {
        docs.push(doc);
    }

    docs
}

fn join_splits(parts: &[&str], separator: &str) -> Option<String> {
    let text = parts.join(separator).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
