//! Retrieval-augmented grounding engine
//!
//! Features:
//! - In-process BM25 keyword index with Latin + CJK tokenization
//! - Brute-force cosine vector store with metadata filters and JSON snapshots
//! - Query analysis (exact signals, glossary expansion, intents)
//! - Intent-aware dynamic fusion of dense and keyword scores
//! - Relevance reranking (optional model, deterministic fallback)
//! - Parent/child aggregation into larger context blocks
//! - Context building: per-source caps, clustering dedup, token budgeting
//! - Core Retriever trait implementation

pub mod aggregator;
pub mod context;
#[cfg(feature = "onnx")]
pub mod cross_encoder;
pub mod engine;
pub mod fusion;
pub mod keyword_index;
pub mod knowledge_loader;
pub mod query_analysis;
pub mod reranker;
pub mod retriever;
pub mod telemetry;
pub mod tokenizer;
pub mod tokens;
pub mod vector_store;

pub use aggregator::{AggregationOutcome, AggregatorConfig, ParentAggregator, ParentGroup};
pub use context::{
    BuiltContext, ContextBuilder, ContextConfig, ContextMetadata, DedupMode, PromptSections,
    SelectedChunk,
};
#[cfg(feature = "onnx")]
pub use cross_encoder::CrossEncoderModel;
pub use engine::{EngineResponse, RagEngine};
pub use fusion::{calculate_dynamic_weights, fuse, FusionConfig, FusionWeights};
pub use keyword_index::{IndexStats, KeywordConfig, KeywordIndex, PinnedKeywordIndex, PreparedIndex};
pub use knowledge_loader::{KnowledgeFile, KnowledgeLoader};
pub use query_analysis::QueryAnalyzer;
pub use reranker::{FallbackScorer, Reranked, RelevanceReranker, RerankerConfig, RerankerStats};
pub use retriever::{RetrievalOutcome, RetrieverConfig, SemanticRetriever};
pub use telemetry::{init_tracing, set_metrics_enabled, DegradedStage};
pub use tokenizer::tokenize;
pub use tokens::estimate_tokens;
pub use vector_store::{
    SearchFilter, VectorGeneration, VectorSnapshot, VectorStore, VectorStoreConfig,
};

use thiserror::Error;

/// RAG errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Keyword index has not been built")]
    IndexNotBuilt,

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Reranker error: {0}")]
    Reranker(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(#[from] grounding_config::ConfigError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] grounding_core::Error),
}

impl From<RagError> for grounding_core::Error {
    fn from(err: RagError) -> Self {
        match err {
            RagError::Collaborator(inner) => inner,
            other => grounding_core::Error::Rag(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for RagError {
    fn from(err: tokio::task::JoinError) -> Self {
        RagError::Task(err.to_string())
    }
}
