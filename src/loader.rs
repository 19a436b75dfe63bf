//! Ingestion orchestrator.
//!
//! Drives the upload → extract → chunk → index pipeline for a batch of
//! files attached to one conversation message. Files in a batch are
//! processed concurrently and independently: one bad file never blocks
//! the others. The batch counts as successful when at least one file
//! contributed indexed chunks, at which point the conversation is
//! marked as having files.
//!
//! Media-type validation happens before any side effect, so a rejected
//! file leaves nothing behind in the object store or the index.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::chunk::split_documents;
use crate::config::{ChunkingConfig, LlmConfig};
use crate::conversation::ConversationStore;
use crate::extract::{extract_document_text, Extractor};
use crate::models::{Chunk, Provenance, UploadedFile};
use crate::object_store::{upload_file, ObjectStore};
use crate::vector_index::VectorIndex;

#[derive(Clone)]
pub struct LoaderService {
    object_store: Arc<dyn ObjectStore>,
    vector_index: Arc<dyn VectorIndex>,
    conversations: Arc<dyn ConversationStore>,
    llm: LlmConfig,
    chunking: ChunkingConfig,
}

impl LoaderService {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        vector_index: Arc<dyn VectorIndex>,
        conversations: Arc<dyn ConversationStore>,
        llm: LlmConfig,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            object_store,
            vector_index,
            conversations,
            llm,
            chunking,
        }
    }

    /// Ingest a batch of files for one message. Returns whether the
    /// batch produced retrievable content. Never propagates errors:
    /// a failed batch is logged and reported as `false`.
    pub async fn run(
        &self,
        files: Vec<UploadedFile>,
        conversation_id: &str,
        message_id: &str,
    ) -> bool {
        if files.is_empty() {
            return false;
        }

        match self.run_batch(files, conversation_id, message_id).await {
            Ok(indexed) => indexed,
            Err(e) => {
                error!(conversation_id, message_id, error = %e, "ingestion batch failed");
                false
            }
        }
    }

    async fn run_batch(
        &self,
        files: Vec<UploadedFile>,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<bool> {
        let record = self.conversations.get(conversation_id).await?;

        let mut tasks = JoinSet::new();
        for file in files {
            let service = self.clone();
            let provenance = Provenance {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            };
            let user_id = record.user_id.clone();

            tasks.spawn(async move {
                let filename = file.filename.clone();
                let result = service.ingest_file(file, &provenance, &user_id).await;
                (filename, result)
            });
        }

        let mut total_chunks = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((filename, Ok(indexed))) => {
                    info!(conversation_id, filename = %filename, indexed, "file ingested");
                    total_chunks += indexed;
                }
                Ok((filename, Err(e))) => {
                    warn!(conversation_id, filename = %filename, error = %e, "file ingestion failed");
                }
                Err(e) => {
                    warn!(conversation_id, error = %e, "ingestion task panicked");
                }
            }
        }

        if total_chunks == 0 {
            return Ok(false);
        }

        self.conversations
            .set_files_uploaded(conversation_id)
            .await?;
        Ok(true)
    }

    /// Ingest a single file end to end. Returns the number of chunks
    /// written to the index.
    async fn ingest_file(
        &self,
        file: UploadedFile,
        provenance: &Provenance,
        user_id: &str,
    ) -> Result<usize> {
        // Validate the media type before touching the object store.
        Extractor::for_media_type(&file.media_type)?;

        let object_key = upload_file(self.object_store.as_ref(), &file, provenance).await?;

        let documents = extract_document_text(
            self.object_store.as_ref(),
            &object_key,
            &file.media_type,
            &file.filename,
            &self.llm,
        )
        .await?;

        let mut chunks = split_documents(
            &documents,
            self.chunking.chunk_size,
            self.chunking.chunk_overlap,
        );
        enrich_chunks(
            &mut chunks,
            &provenance.conversation_id,
            &provenance.message_id,
            user_id,
        );

        if chunks.is_empty() {
            return Ok(0);
        }

        self.vector_index.add(&chunks).await?;
        Ok(chunks.len())
    }
}

/// Stamp provenance and position onto each chunk before indexing.
/// `order` is the chunk's 0-based position within its file.
pub fn enrich_chunks(chunks: &mut [Chunk], conversation_id: &str, message_id: &str, user_id: &str) {
    for (order, chunk) in chunks.iter_mut().enumerate() {
        chunk
            .metadata
            .insert("conversation_id".to_string(), json!(conversation_id));
        chunk
            .metadata
            .insert("message_id".to_string(), json!(message_id));
        chunk.metadata.insert("user_id".to_string(), json!(user_id));
        chunk.metadata.insert("order".to_string(), json!(order));
    }
}
