//! Context retrieval orchestrator.
//!
//! Entry point for the query path: given a user query and any files
//! attached to the message, ingest the files, search the conversation's
//! indexed chunks, and return either a context-augmented prompt or the
//! raw query. The raw query is the universal fallback; retrieval
//! problems degrade the answer, they never block it. Only an unknown
//! conversation id is a hard error.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::conversation::ConversationStore;
use crate::loader::LoaderService;
use crate::models::{filter_valid_files, Metadata, UploadedFile};
use crate::optimize::ResultOptimizer;
use crate::vector_index::VectorIndex;

/// Default number of nearest neighbors fetched per query.
pub const DEFAULT_TOP_K: usize = 4;

const CONTEXT_TEMPLATE: &str = "Use the following pieces of context to answer the question at the end.\n\n{context}\n\nQuestion: {question}";

/// Render retrieved context and the user question into the final prompt.
pub fn format_context(context: &str, question: &str) -> String {
    CONTEXT_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

pub struct RetrievalService {
    loader: LoaderService,
    vector_index: Arc<dyn VectorIndex>,
    conversations: Arc<dyn ConversationStore>,
    optimizer: ResultOptimizer,
    top_k: usize,
    namespace: Option<String>,
}

impl RetrievalService {
    pub fn new(
        loader: LoaderService,
        vector_index: Arc<dyn VectorIndex>,
        conversations: Arc<dyn ConversationStore>,
        optimizer: ResultOptimizer,
        top_k: usize,
        namespace: Option<String>,
    ) -> Self {
        Self {
            loader,
            vector_index,
            conversations,
            optimizer,
            top_k,
            namespace,
        }
    }

    /// Resolve a query into the prompt handed to the chat model.
    ///
    /// Attached files are ingested first; whether or not that succeeds,
    /// the conversation's index is then searched and the query is
    /// augmented with whatever relevant context exists. Conversations
    /// that never had files skip the search entirely.
    pub async fn run(
        &self,
        query: &str,
        conversation_id: &str,
        message_id: &str,
        files: Vec<UploadedFile>,
    ) -> Result<String> {
        let valid_files = filter_valid_files(files);

        let record = self.conversations.get(conversation_id).await?;

        if valid_files.is_empty() && !record.has_files_uploaded {
            return Ok(query.to_string());
        }

        if !valid_files.is_empty() {
            let indexed = self
                .loader
                .run(valid_files, conversation_id, message_id)
                .await;
            if !indexed {
                // Indexing failure never blocks the chat turn.
                return Ok(query.to_string());
            }
        }

        match self.retrieve_context(query, conversation_id).await {
            Ok(Some(context)) => Ok(format_context(&context, query)),
            Ok(None) => {
                debug!(conversation_id, "no relevant context found");
                Ok(query.to_string())
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "context retrieval failed");
                Ok(query.to_string())
            }
        }
    }

    /// Search the conversation's chunks and optimize the hits into a
    /// single context string. `None` when nothing relevant survives.
    async fn retrieve_context(
        &self,
        query: &str,
        conversation_id: &str,
    ) -> Result<Option<String>> {
        let mut filter = Metadata::new();
        filter.insert("conversation_id".to_string(), json!(conversation_id));

        let hits = self
            .vector_index
            .search_with_score(query, self.top_k, &filter, self.namespace.as_deref())
            .await?;

        let chunks = self.optimizer.optimize(hits, query).await?;
        if chunks.is_empty() {
            return Ok(None);
        }

        let context = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Some(context))
    }
}
