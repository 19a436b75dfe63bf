//! Vector index gateway.
//!
//! Wraps an [`Embedder`](crate::embedding::Embedder) and a vector
//! database behind the [`VectorIndex`] trait: add chunks, similarity
//! search with scores, and metadata-filtered deletion.
//!
//! `add` is all-or-nothing per call and errors propagate to the
//! orchestrator, which treats the whole ingestion or retrieval attempt
//! as failed. Entries are never mutated once written; they leave the
//! index only through an explicit `delete` (conversation teardown).

use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, Embedder};
use crate::models::{Chunk, Metadata, ScoredChunk};

/// Abstract vector database with an embedding function in front.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Embed and write chunks. No partial-failure API: treat each call
    /// as all-or-nothing and let the underlying error propagate.
    async fn add(&self, chunks: &[Chunk]) -> Result<()>;

    /// Return up to `k` nearest neighbors with scores in `[0, 1]`
    /// (higher = more relevant), restricted to entries whose metadata
    /// matches every key of `filter` exactly.
    async fn search_with_score(
        &self,
        query: &str,
        k: usize,
        filter: &Metadata,
        namespace: Option<&str>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove all entries matching `filter`.
    async fn delete(&self, filter: &Metadata, namespace: Option<&str>) -> Result<()>;
}

/// Exact-match test used by the in-memory index; every filter key must
/// be present in the metadata with an equal value.
pub fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

struct IndexEntry {
    vector: Vec<f32>,
    chunk: Chunk,
}

/// Brute-force in-memory index for tests and offline use.
///
/// Stores embeddings in a `Vec` behind an `RwLock` and scores by
/// cosine similarity mapped to `[0, 1]` via `(cos + 1) / 2`.
/// Namespaces are ignored: everything lives in one space.
pub struct MemoryIndex {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<IndexEntry>>,
}

impl MemoryIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored entries. Test helper.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn add(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        // One embed call for the batch keeps add all-or-nothing.
        let vectors = self.embedder.embed(&texts).await?;

        let mut entries = self.entries.write().unwrap();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            entries.push(IndexEntry {
                vector,
                chunk: chunk.clone(),
            });
        }
        Ok(())
    }

    async fn search_with_score(
        &self,
        query: &str,
        k: usize,
        filter: &Metadata,
        _namespace: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.embedder.embed_query(query).await?;

        let entries = self.entries.read().unwrap();
        let mut hits: Vec<ScoredChunk> = entries
            .iter()
            .filter(|entry| metadata_matches(&entry.chunk.metadata, filter))
            .map(|entry| ScoredChunk {
                chunk: entry.chunk.clone(),
                score: ((cosine_similarity(&query_vec, &entry.vector) + 1.0) / 2.0) as f64,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, filter: &Metadata, _namespace: Option<&str>) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|entry| !metadata_matches(&entry.chunk.metadata, filter));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Deterministic embedder: maps known words onto fixed unit
    /// vectors so tests can steer similarity scores.
    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        fn model_name(&self) -> &str {
            "word-test"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("refund") {
                        vec![1.0, 0.0, 0.0]
                    } else if t.contains("shipping") {
                        vec![0.0, 1.0, 0.0]
                    } else {
                        vec![0.0, 0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    fn chunk(text: &str, conversation_id: &str) -> Chunk {
        let mut metadata = Metadata::new();
        metadata.insert("conversation_id".to_string(), json!(conversation_id));
        Chunk {
            text: text.to_string(),
            metadata,
        }
    }

    fn conversation_filter(conversation_id: &str) -> Metadata {
        let mut filter = Metadata::new();
        filter.insert("conversation_id".to_string(), json!(conversation_id));
        filter
    }

    #[tokio::test]
    async fn test_search_is_scoped_by_conversation() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder));
        index
            .add(&[chunk("refund policy", "c1"), chunk("refund window", "c2")])
            .await
            .unwrap();

        let hits = index
            .search_with_score("refund", 10, &conversation_filter("c1"), None)
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].chunk.metadata.get("conversation_id"),
            Some(&json!("c1"))
        );
    }

    #[tokio::test]
    async fn test_scores_sorted_descending_and_in_unit_range() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder));
        index
            .add(&[
                chunk("refund details", "c1"),
                chunk("shipping details", "c1"),
                chunk("unrelated", "c1"),
            ])
            .await
            .unwrap();

        let hits = index
            .search_with_score("refund", 10, &conversation_filter("c1"), None)
            .await
            .unwrap();

        assert_eq!(hits.len(), 3);
        assert!(hits[0].chunk.text.contains("refund"));
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.score));
        }
    }

    #[tokio::test]
    async fn test_k_truncates() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder));
        let chunks: Vec<Chunk> = (0..8).map(|i| chunk(&format!("refund {i}"), "c1")).collect();
        index.add(&chunks).await.unwrap();

        let hits = index
            .search_with_score("refund", 4, &conversation_filter("c1"), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[tokio::test]
    async fn test_delete_by_filter() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder));
        index
            .add(&[chunk("refund", "c1"), chunk("refund", "c2")])
            .await
            .unwrap();
        assert_eq!(index.len(), 2);

        index.delete(&conversation_filter("c1"), None).await.unwrap();
        assert_eq!(index.len(), 1);

        let hits = index
            .search_with_score("refund", 10, &conversation_filter("c1"), None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_add_empty_is_noop() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder));
        index.add(&[]).await.unwrap();
        assert!(index.is_empty());
    }
}
