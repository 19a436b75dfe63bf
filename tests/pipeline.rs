//! End-to-end pipeline tests over the in-memory backends.
//!
//! A deterministic keyword embedder stands in for the OpenAI provider
//! so similarity scores are predictable: chunks sharing a keyword with
//! the query score near 1.0, disjoint chunks near 0.5 (below the
//! default 0.6 cutoff).

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

use chat_context::compress::PassthroughCompressor;
use chat_context::config::{ChunkingConfig, LlmConfig};
use chat_context::conversation::{ConversationRecord, ConversationStore, InMemoryConversations};
use chat_context::embedding::Embedder;
use chat_context::extract::{MIME_CSV, MIME_JSON};
use chat_context::loader::LoaderService;
use chat_context::models::{Chunk, Metadata, ScoredChunk, UploadedFile};
use chat_context::object_store::InMemoryObjectStore;
use chat_context::optimize::{ResultOptimizer, DEFAULT_MIN_SCORE};
use chat_context::retrieval::{RetrievalService, DEFAULT_TOP_K};
use chat_context::vector_index::{MemoryIndex, VectorIndex};

const KEYWORDS: [&str; 3] = ["refund", "shipping", "invoice"];

/// Maps text onto a fixed vector per keyword, plus a small shared
/// baseline so no vector is ever zero.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }
    fn dims(&self) -> usize {
        KEYWORDS.len() + 1
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                let mut v: Vec<f32> = KEYWORDS
                    .iter()
                    .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
                    .collect();
                v.push(0.1);
                v
            })
            .collect())
    }
}

/// Index whose every operation fails, for degradation tests.
struct FailingVectorIndex;

#[async_trait]
impl VectorIndex for FailingVectorIndex {
    async fn add(&self, _chunks: &[Chunk]) -> Result<()> {
        bail!("index unavailable")
    }
    async fn search_with_score(
        &self,
        _query: &str,
        _k: usize,
        _filter: &Metadata,
        _namespace: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        bail!("index unavailable")
    }
    async fn delete(&self, _filter: &Metadata, _namespace: Option<&str>) -> Result<()> {
        bail!("index unavailable")
    }
}

struct Harness {
    store: Arc<InMemoryObjectStore>,
    index: Arc<MemoryIndex>,
    conversations: Arc<InMemoryConversations>,
    loader: LoaderService,
    retrieval: RetrievalService,
}

fn harness() -> Harness {
    harness_with_index(Arc::new(MemoryIndex::new(Arc::new(KeywordEmbedder))))
}

fn harness_with_index(index: Arc<MemoryIndex>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(InMemoryObjectStore::new());
    let conversations = Arc::new(InMemoryConversations::new());
    conversations.insert(ConversationRecord {
        id: "c1".to_string(),
        user_id: "u1".to_string(),
        has_files_uploaded: false,
    });
    conversations.insert(ConversationRecord {
        id: "c2".to_string(),
        user_id: "u2".to_string(),
        has_files_uploaded: false,
    });

    let loader = LoaderService::new(
        store.clone(),
        index.clone(),
        conversations.clone(),
        LlmConfig::default(),
        ChunkingConfig::default(),
    );
    let retrieval = RetrievalService::new(
        loader.clone(),
        index.clone(),
        conversations.clone(),
        ResultOptimizer::new(Arc::new(PassthroughCompressor), DEFAULT_MIN_SCORE),
        DEFAULT_TOP_K,
        None,
    );

    Harness {
        store,
        index,
        conversations,
        loader,
        retrieval,
    }
}

fn csv_file(filename: &str, body: &str) -> UploadedFile {
    UploadedFile {
        filename: filename.to_string(),
        content: body.as_bytes().to_vec(),
        media_type: MIME_CSV.to_string(),
    }
}

fn refund_csv() -> UploadedFile {
    csv_file(
        "policies.csv",
        "topic,policy\nrefund,Refunds are accepted within 30 days of purchase\nshipping,Orders ship within 2 business days\n",
    )
}

#[tokio::test]
async fn empty_batch_has_no_side_effects() {
    let h = harness();

    let indexed = h.loader.run(Vec::new(), "c1", "m1").await;

    assert!(!indexed);
    assert!(h.store.is_empty());
    assert!(h.index.is_empty());
    assert!(!h.conversations.get("c1").await.unwrap().has_files_uploaded);
}

#[tokio::test]
async fn csv_ingestion_indexes_chunks_with_provenance() {
    let h = harness();

    let indexed = h.loader.run(vec![refund_csv()], "c1", "m1").await;

    assert!(indexed);
    assert_eq!(h.store.len(), 1);
    assert!(h.index.len() >= 2); // one chunk per CSV row
    assert!(h.conversations.get("c1").await.unwrap().has_files_uploaded);

    let mut filter = Metadata::new();
    filter.insert("conversation_id".to_string(), json!("c1"));
    let hits = h
        .index
        .search_with_score("refund", 10, &filter, None)
        .await
        .unwrap();

    assert!(!hits.is_empty());
    let metadata = &hits[0].chunk.metadata;
    assert_eq!(metadata.get("conversation_id"), Some(&json!("c1")));
    assert_eq!(metadata.get("message_id"), Some(&json!("m1")));
    assert_eq!(metadata.get("user_id"), Some(&json!("u1")));
    assert_eq!(metadata.get("source"), Some(&json!("policies.csv")));
    assert!(metadata.get("order").unwrap().as_u64().is_some());
}

#[tokio::test]
async fn unsupported_media_type_leaves_nothing_behind() {
    let h = harness();

    let file = UploadedFile {
        filename: "binary.bin".to_string(),
        content: vec![0, 1, 2, 3],
        media_type: "application/octet-stream".to_string(),
    };
    let indexed = h.loader.run(vec![file], "c1", "m1").await;

    assert!(!indexed);
    assert!(h.store.is_empty());
    assert!(h.index.is_empty());
    assert!(!h.conversations.get("c1").await.unwrap().has_files_uploaded);
}

#[tokio::test]
async fn mixed_batch_keeps_the_good_file() {
    let h = harness();

    let bad = UploadedFile {
        filename: "binary.bin".to_string(),
        content: vec![0, 1, 2, 3],
        media_type: "application/octet-stream".to_string(),
    };
    let indexed = h.loader.run(vec![refund_csv(), bad], "c1", "m1").await;

    assert!(indexed);
    // Only the CSV made it into storage and the index.
    assert_eq!(h.store.len(), 1);
    assert!(h.index.len() >= 2);
    assert!(h.conversations.get("c1").await.unwrap().has_files_uploaded);
}

#[tokio::test]
async fn json_files_are_ingested() {
    let h = harness();

    let file = UploadedFile {
        filename: "faq.json".to_string(),
        content: br#"{"refund": "Refunds are accepted within 30 days"}"#.to_vec(),
        media_type: MIME_JSON.to_string(),
    };
    let indexed = h.loader.run(vec![file], "c1", "m1").await;

    assert!(indexed);
    assert_eq!(h.index.len(), 1);
}

#[tokio::test]
async fn query_without_files_or_history_passes_through() {
    let h = harness();

    let prompt = h
        .retrieval
        .run("what is the refund window?", "c1", "m1", Vec::new())
        .await
        .unwrap();

    assert_eq!(prompt, "what is the refund window?");
}

#[tokio::test]
async fn relevant_context_augments_the_query() {
    let h = harness();
    assert!(h.loader.run(vec![refund_csv()], "c1", "m1").await);

    let prompt = h
        .retrieval
        .run("what is the refund window?", "c1", "m2", Vec::new())
        .await
        .unwrap();

    assert!(prompt.starts_with("Use the following pieces of context"));
    assert!(prompt.contains("Refunds are accepted within 30 days"));
    assert!(prompt.ends_with("Question: what is the refund window?"));
}

#[tokio::test]
async fn irrelevant_query_falls_back_to_raw() {
    let h = harness();
    assert!(h.loader.run(vec![refund_csv()], "c1", "m1").await);

    // No chunk mentions invoices; every hit scores ~0.5, below the cutoff.
    let prompt = h
        .retrieval
        .run("where is my invoice?", "c1", "m2", Vec::new())
        .await
        .unwrap();

    assert_eq!(prompt, "where is my invoice?");
}

#[tokio::test]
async fn conversations_are_isolated() {
    let h = harness();
    assert!(h.loader.run(vec![refund_csv()], "c1", "m1").await);

    // c2 never uploaded anything; c1's chunks must not leak into it.
    let prompt = h
        .retrieval
        .run("what is the refund window?", "c2", "m1", Vec::new())
        .await
        .unwrap();
    assert_eq!(prompt, "what is the refund window?");
}

#[tokio::test]
async fn attached_files_are_ingested_before_answering() {
    let h = harness();

    let prompt = h
        .retrieval
        .run("what is the refund window?", "c1", "m1", vec![refund_csv()])
        .await
        .unwrap();

    assert!(prompt.starts_with("Use the following pieces of context"));
    assert!(h.conversations.get("c1").await.unwrap().has_files_uploaded);
}

#[tokio::test]
async fn invalid_attachments_are_treated_as_absent() {
    let h = harness();

    let nameless = UploadedFile {
        filename: String::new(),
        content: b"x".to_vec(),
        media_type: MIME_CSV.to_string(),
    };
    let prompt = h
        .retrieval
        .run("hello", "c1", "m1", vec![nameless])
        .await
        .unwrap();

    assert_eq!(prompt, "hello");
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn unknown_conversation_is_a_hard_error() {
    let h = harness();

    let result = h.retrieval.run("hello", "missing", "m1", Vec::new()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn index_write_failure_degrades_ingestion() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conversations = Arc::new(InMemoryConversations::new());
    conversations.insert(ConversationRecord {
        id: "c1".to_string(),
        user_id: "u1".to_string(),
        has_files_uploaded: false,
    });
    let loader = LoaderService::new(
        store.clone(),
        Arc::new(FailingVectorIndex),
        conversations.clone(),
        LlmConfig::default(),
        ChunkingConfig::default(),
    );

    let indexed = loader.run(vec![refund_csv()], "c1", "m1").await;

    assert!(!indexed);
    // Original bytes stay retrievable even though indexing failed.
    assert_eq!(store.len(), 1);
    assert!(!conversations.get("c1").await.unwrap().has_files_uploaded);
}

#[tokio::test]
async fn search_failure_degrades_to_raw_query() {
    let store = Arc::new(InMemoryObjectStore::new());
    let conversations = Arc::new(InMemoryConversations::new());
    conversations.insert(ConversationRecord {
        id: "c1".to_string(),
        user_id: "u1".to_string(),
        has_files_uploaded: true,
    });
    let failing: Arc<dyn VectorIndex> = Arc::new(FailingVectorIndex);
    let loader = LoaderService::new(
        store,
        failing.clone(),
        conversations.clone(),
        LlmConfig::default(),
        ChunkingConfig::default(),
    );
    let retrieval = RetrievalService::new(
        loader,
        failing,
        conversations,
        ResultOptimizer::new(Arc::new(PassthroughCompressor), DEFAULT_MIN_SCORE),
        DEFAULT_TOP_K,
        None,
    );

    let prompt = retrieval.run("hello", "c1", "m1", Vec::new()).await.unwrap();
    assert_eq!(prompt, "hello");
}
