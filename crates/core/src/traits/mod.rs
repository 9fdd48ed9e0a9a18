//! Core traits for the grounding engine
//!
//! Optional capabilities are injected as trait objects so they can be
//! swapped, mocked in tests, or left out entirely:
//!
//! ```text
//! Collaborators (external, contract only):
//!   - Embedder: text -> fixed-dimension vector
//!   - ClusteringService: chunks + threshold -> groups of chunk ids
//!   - DiversityReranker: query + ranked results -> reordered subset (MMR)
//!   - ConversationContextProvider: query -> formatted history + token count
//!   - RelevanceModel: (query, passage) batch -> relevance scores
//!
//! Retrieval:
//!   - Retriever: query -> ranked results
//! ```

mod collaborators;
mod retriever;

pub use collaborators::{
    ClusteringService, ConversationContextProvider, ConversationSnippet, DiversityReranker,
    Embedder, RelevanceModel,
};
pub use retriever::{RetrieveOptions, Retriever};
