//! Retrieval traits for RAG

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::retrieval::RetrievalResult;
use crate::Result;

/// Retriever interface
///
/// Implementations:
/// - `SemanticRetriever` - keyword + dense fusion, reranking, aggregation
///
/// # Example
///
/// ```ignore
/// let retriever: Arc<dyn Retriever> = Arc::new(semantic_retriever);
/// let options = RetrieveOptions::default().with_top_k(5);
/// let results = retriever.retrieve("what is the $ABC contract address", &options).await?;
/// for r in results {
///     println!("{}: {}", r.effective_score(), r.text);
/// }
/// ```
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Retrieve relevant passages, highest first
    async fn retrieve(&self, query: &str, options: &RetrieveOptions)
        -> Result<Vec<RetrievalResult>>;

    /// Retriever name for logging
    fn name(&self) -> &str;
}

/// Retrieval options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveOptions {
    /// Number of results to return
    pub top_k: usize,
    /// Minimum effective score
    pub min_score: f32,
    /// Run the relevance reranker
    #[serde(default = "default_true")]
    pub rerank: bool,
    /// Return parent blocks instead of fragment-level hits
    #[serde(default)]
    pub aggregate: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.0,
            rerank: true,
            aggregate: false,
        }
    }
}

impl RetrieveOptions {
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score.max(0.0);
        self
    }

    pub fn without_rerank(mut self) -> Self {
        self.rerank = false;
        self
    }

    pub fn aggregated(mut self) -> Self {
        self.aggregate = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieve_options_builder() {
        let options = RetrieveOptions::default()
            .with_top_k(10)
            .with_min_score(0.5)
            .without_rerank()
            .aggregated();

        assert_eq!(options.top_k, 10);
        assert_eq!(options.min_score, 0.5);
        assert!(!options.rerank);
        assert!(options.aggregate);
    }

    #[test]
    fn test_negative_min_score_floors_at_zero() {
        let options = RetrieveOptions::default().with_min_score(-1.0);
        assert_eq!(options.min_score, 0.0);
    }
}
