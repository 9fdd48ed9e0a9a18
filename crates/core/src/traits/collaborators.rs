//! External collaborator contracts
//!
//! The engine never implements these capabilities itself. When one is
//! absent the consuming component uses its documented fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkId;
use crate::retrieval::RetrievalResult;
use crate::Result;

/// Embedding function
///
/// Every vector returned must have exactly `dimension()` components.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Semantic clustering capability
///
/// Items whose pairwise cosine similarity is at least `threshold` belong to
/// the same cluster. Returned groups contain ids from `items` only; ids
/// missing from every group are treated as singletons by the caller.
#[async_trait]
pub trait ClusteringService: Send + Sync + 'static {
    async fn cluster(&self, items: &[RetrievalResult], threshold: f32)
        -> Result<Vec<Vec<ChunkId>>>;
}

/// Diversity-aware reranker (MMR or similar)
///
/// Returns at most `target` results drawn from `results`, trading relevance
/// against redundancy with already selected items. Implementations may set
/// `mmr_score` on the returned records.
#[async_trait]
pub trait DiversityReranker: Send + Sync + 'static {
    async fn select(
        &self,
        query: &str,
        results: Vec<RetrievalResult>,
        target: usize,
    ) -> Result<Vec<RetrievalResult>>;
}

/// Formatted conversation history for the context budget
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnippet {
    pub text: String,
    /// Provider's own token count for `text`; 0 when it does not count
    pub tokens: usize,
}

/// Conversation-context provider
#[async_trait]
pub trait ConversationContextProvider: Send + Sync + 'static {
    async fn context_for(&self, query: &str) -> Result<ConversationSnippet>;
}

/// Model-backed relevance scorer (cross-encoder or similar)
///
/// `score_batch` returns one score in [0, 1] per passage, in input order.
#[async_trait]
pub trait RelevanceModel: Send + Sync + 'static {
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}
