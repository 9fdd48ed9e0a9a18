//! Core traits and types for the grounding RAG engine
//!
//! This crate provides foundational types used across the other crates:
//! - Chunk, metadata and meta-card records
//! - Transient retrieval records (results, parent blocks)
//! - Query analysis types (exact signals, intents)
//! - Collaborator traits for pluggable capabilities (embedding, clustering,
//!   diversity reranking, conversation context, relevance models)
//! - Error types

pub mod chunk;
pub mod error;
pub mod query;
pub mod retrieval;
pub mod traits;

pub use chunk::{Chunk, ChunkId, ChunkMetadata, MetaCard};
pub use error::{Error, Result};
pub use query::{ExactSignal, Intent, IntentKind, QueryAnalysis, SignalKind};
pub use retrieval::{BuildMode, ChildRef, ParentBlock, RetrievalResult, SearchSource};

pub use traits::{
    // Collaborators
    ClusteringService,
    ConversationContextProvider,
    ConversationSnippet,
    DiversityReranker,
    Embedder,
    RelevanceModel,
    // Retrieval
    RetrieveOptions,
    Retriever,
};
