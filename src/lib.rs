//! # Chat Context
//!
//! A file-grounded context pipeline for conversational AI backends.
//!
//! Chat Context ingests files attached to chat messages (PDF, xlsx,
//! CSV, JSON, images), stores the originals in an object store, splits
//! the extracted text into overlapping chunks, and indexes them in a
//! vector database scoped to their conversation. At query time it
//! retrieves the most relevant chunks, compresses them against the
//! query, reorders them for long-context models, and hands back a
//! context-augmented prompt.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Uploads  │──▶│   Ingestion   │──▶│ Vector index │
//! │ PDF/CSV/… │   │ Store+Extract │   │  (scoped by  │
//! └───────────┘   │  Chunk+Embed  │   │ conversation)│
//!                 └──────────────┘   └──────┬──────┘
//!                                           │
//!                 ┌──────────────┐          ▼
//!   query ───────▶│   Retrieval   │◀── top-k search
//!                 │ cutoff+squeeze│
//!                 │   +reorder    │──▶ augmented prompt
//!                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`object_store`] | Object store gateway + in-memory backend |
//! | [`s3_store`] | Amazon S3 backend (SigV4) |
//! | [`extract`] | Multi-format text extraction |
//! | [`chunk`] | Recursive text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | Vector index gateway + in-memory backend |
//! | [`pinecone`] | Pinecone backend |
//! | [`llm`] | Chat-completion client |
//! | [`compress`] | Query-aware chunk compression |
//! | [`optimize`] | Relevance cutoff + lost-in-the-middle reordering |
//! | [`conversation`] | Conversation store boundary |
//! | [`loader`] | Ingestion orchestrator |
//! | [`retrieval`] | Context retrieval orchestrator |

pub mod chunk;
pub mod compress;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod extract;
pub mod llm;
pub mod loader;
pub mod models;
pub mod object_store;
pub mod optimize;
pub mod pinecone;
pub mod retrieval;
pub mod s3_store;
pub mod vector_index;
