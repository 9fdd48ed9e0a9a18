//! Error types shared with external collaborators

use thiserror::Error;

/// Errors crossing the collaborator boundary
#[derive(Error, Debug)]
pub enum Error {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error("Diversity reranker error: {0}")]
    Diversity(String),

    #[error("Conversation context error: {0}")]
    Context(String),

    #[error("Relevance model error: {0}")]
    Model(String),

    #[error("Retrieval error: {0}")]
    Rag(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
