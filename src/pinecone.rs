//! Pinecone-backed vector index.
//!
//! Talks to the Pinecone data plane over its REST API: `/vectors/upsert`,
//! `/query`, and `/vectors/delete`. The chunk text travels inside vector
//! metadata under the `"text"` key so query responses can be turned back
//! into chunks without a second store.
//!
//! Requires the `PINECONE_API_KEY` environment variable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::embedding::Embedder;
use crate::models::{Chunk, Metadata, ScoredChunk};
use crate::vector_index::VectorIndex;

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum vectors per upsert request (the data plane caps requests at
/// 1000 vectors / 2 MB; 100 keeps bodies well under both).
const UPSERT_BATCH_SIZE: usize = 100;

pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
    embedder: Arc<dyn Embedder>,
    namespace: Option<String>,
}

impl PineconeIndex {
    /// `host` is the index data-plane host, without scheme
    /// (e.g. `"chat-store-abc123.svc.us-east-1.pinecone.io"`).
    pub fn new(
        host: &str,
        embedder: Arc<dyn Embedder>,
        namespace: Option<String>,
    ) -> Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            api_key,
            embedder,
            namespace,
        })
    }

    fn namespace_for(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(|n| n.to_string())
            .or_else(|| self.namespace.clone())
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("https://{}{}", self.host, path);
        let response = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let excerpt: String = body_text.chars().take(500).collect();
            bail!("Pinecone API error {} on {}: {}", status, path, excerpt);
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn add(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let namespace = self.namespace_for(None);
        let bodies = upsert_request_bodies(chunks, vectors, namespace.as_deref());
        // First failed batch aborts the call; the error propagates to
        // the orchestrator, which treats the whole add as failed.
        for body in &bodies {
            self.post("/vectors/upsert", body).await?;
        }
        Ok(())
    }

    async fn search_with_score(
        &self,
        query: &str,
        k: usize,
        filter: &Metadata,
        namespace: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vec = self.embedder.embed_query(query).await?;

        let mut body = json!({
            "vector": query_vec,
            "topK": k,
            "includeMetadata": true,
        });
        if !filter.is_empty() {
            body["filter"] = pinecone_filter(filter);
        }
        if let Some(ns) = self.namespace_for(namespace) {
            body["namespace"] = json!(ns);
        }

        let response = self.post("/query", &body).await?;
        parse_query_response(&response)
    }

    async fn delete(&self, filter: &Metadata, namespace: Option<&str>) -> Result<()> {
        let mut body = json!({ "filter": pinecone_filter(filter) });
        if let Some(ns) = self.namespace_for(namespace) {
            body["namespace"] = json!(ns);
        }

        self.post("/vectors/delete", &body).await?;
        Ok(())
    }
}

/// Pair chunks with their vectors and split them into upsert request
/// bodies of at most [`UPSERT_BATCH_SIZE`] vectors each.
fn upsert_request_bodies(
    chunks: &[Chunk],
    vectors: Vec<Vec<f32>>,
    namespace: Option<&str>,
) -> Vec<Value> {
    let entries: Vec<Value> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, values)| {
            let mut metadata = chunk.metadata.clone();
            metadata.insert("text".to_string(), json!(chunk.text));
            json!({
                "id": Uuid::new_v4().to_string(),
                "values": values,
                "metadata": metadata,
            })
        })
        .collect();

    entries
        .chunks(UPSERT_BATCH_SIZE)
        .map(|batch| {
            let mut body = json!({ "vectors": batch });
            if let Some(ns) = namespace {
                body["namespace"] = json!(ns);
            }
            body
        })
        .collect()
}

/// Translate an exact-match metadata filter into Pinecone's `$eq` form.
fn pinecone_filter(filter: &Metadata) -> Value {
    let mut out = serde_json::Map::new();
    for (key, value) in filter {
        out.insert(key.clone(), json!({ "$eq": value }));
    }
    Value::Object(out)
}

/// Parse a Pinecone query response into scored chunks. The stored text
/// is pulled out of metadata; matches without a `"text"` key are skipped.
fn parse_query_response(response: &Value) -> Result<Vec<ScoredChunk>> {
    let matches = response
        .get("matches")
        .and_then(|m| m.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Pinecone response: missing matches array"))?;

    let mut hits = Vec::with_capacity(matches.len());
    for entry in matches {
        let score = entry.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
        let mut metadata: Metadata = entry
            .get("metadata")
            .and_then(|m| m.as_object())
            .cloned()
            .unwrap_or_default();

        let text = match metadata.remove("text") {
            Some(Value::String(s)) => s,
            _ => continue,
        };

        hits.push(ScoredChunk {
            chunk: Chunk { text, metadata },
            score,
        });
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_uses_eq_operator() {
        let mut filter = Metadata::new();
        filter.insert("conversation_id".to_string(), json!("c1"));
        let translated = pinecone_filter(&filter);
        assert_eq!(translated["conversation_id"]["$eq"], json!("c1"));
    }

    #[test]
    fn test_parse_query_response() {
        let response = json!({
            "matches": [
                {
                    "id": "v1",
                    "score": 0.92,
                    "metadata": { "text": "refund policy", "conversation_id": "c1" }
                },
                {
                    "id": "v2",
                    "score": 0.40,
                    "metadata": { "conversation_id": "c1" }
                }
            ]
        });

        let hits = parse_query_response(&response).unwrap();
        // The match without stored text is skipped.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.text, "refund policy");
        assert!((hits[0].score - 0.92).abs() < 1e-9);
        assert_eq!(hits[0].chunk.metadata.get("conversation_id"), Some(&json!("c1")));
        assert!(hits[0].chunk.metadata.get("text").is_none());
    }

    #[test]
    fn test_parse_rejects_missing_matches() {
        assert!(parse_query_response(&json!({})).is_err());
    }

    #[test]
    fn test_upserts_stay_within_the_request_cap() {
        let chunks: Vec<Chunk> = (0..250)
            .map(|i| Chunk {
                text: format!("chunk {i}"),
                metadata: Metadata::new(),
            })
            .collect();
        let vectors = vec![vec![0.0f32; 4]; 250];

        let bodies = upsert_request_bodies(&chunks, vectors, Some("ns"));

        let sizes: Vec<usize> = bodies
            .iter()
            .map(|b| b["vectors"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert!(sizes.iter().all(|&n| n <= UPSERT_BATCH_SIZE));
        assert_eq!(bodies[0]["namespace"], json!("ns"));
        assert_eq!(bodies[2]["vectors"][49]["metadata"]["text"], json!("chunk 249"));
    }
}
