//! Contextual compression of retrieved chunks.
//!
//! After the relevance cutoff, each surviving chunk is boiled down to
//! the parts that actually bear on the query. The chat model is asked
//! to quote relevant passages verbatim; chunks it deems irrelevant are
//! dropped entirely. Chunk order is preserved so the downstream
//! reordering step sees hits still sorted by relevance.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::llm;
use crate::models::Chunk;

/// Sentinel the model returns for a chunk with nothing relevant in it.
const NO_OUTPUT: &str = "NO_OUTPUT";

const COMPRESS_PROMPT: &str = "Given the following question and context, extract any part of \
the context *AS IS* that is relevant to answer the question. If none of the context is \
relevant return NO_OUTPUT.\n\nRemember, *DO NOT* edit the extracted parts of the context.";

/// Query-aware chunk compression.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compress chunks against a query. May drop chunks; never reorders.
    async fn compress(&self, chunks: Vec<Chunk>, query: &str) -> Result<Vec<Chunk>>;
}

/// Identity compressor used when no chat model is configured.
pub struct PassthroughCompressor;

#[async_trait]
impl Compressor for PassthroughCompressor {
    async fn compress(&self, chunks: Vec<Chunk>, _query: &str) -> Result<Vec<Chunk>> {
        Ok(chunks)
    }
}

/// Chat-model-backed extractor. One completion per chunk, sequential,
/// so output order matches input order.
pub struct LlmExtractCompressor {
    config: LlmConfig,
}

impl LlmExtractCompressor {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Compressor for LlmExtractCompressor {
    async fn compress(&self, chunks: Vec<Chunk>, query: &str) -> Result<Vec<Chunk>> {
        let mut compressed = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let messages = serde_json::json!([
                { "role": "system", "content": COMPRESS_PROMPT },
                {
                    "role": "user",
                    "content": format!("Question: {}\n\nContext:\n{}", query, chunk.text)
                }
            ]);

            let extracted = llm::chat_completion(&self.config, messages).await?;
            let extracted = extracted.trim();

            if extracted.is_empty() || extracted == NO_OUTPUT {
                continue;
            }

            compressed.push(Chunk {
                text: extracted.to_string(),
                metadata: chunk.metadata,
            });
        }

        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;

    #[tokio::test]
    async fn test_passthrough_is_identity() {
        let chunks = vec![
            Chunk {
                text: "first".to_string(),
                metadata: Metadata::new(),
            },
            Chunk {
                text: "second".to_string(),
                metadata: Metadata::new(),
            },
        ];

        let out = PassthroughCompressor
            .compress(chunks.clone(), "anything")
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "first");
        assert_eq!(out[1].text, "second");
    }

    #[tokio::test]
    async fn test_llm_compressor_fails_when_disabled() {
        let compressor = LlmExtractCompressor::new(LlmConfig::default());
        let chunks = vec![Chunk {
            text: "text".to_string(),
            metadata: Metadata::new(),
        }];
        assert!(compressor.compress(chunks, "q").await.is_err());
    }
}
