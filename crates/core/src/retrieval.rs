//! Transient retrieval records
//!
//! Created per retrieval call and discarded afterwards.

use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkId, ChunkMetadata, MetaCard};

/// Which search produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Dense,
    Keyword,
    Hybrid,
    /// Reconstituted parent block
    Aggregated,
}

/// A candidate passage moving through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub id: ChunkId,
    pub text: String,
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub meta_card: Option<MetaCard>,
    /// Carried for semantic clustering downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Raw score from whichever stage created the record
    pub score: f32,
    pub dense_score: Option<f32>,
    pub bm25_score: Option<f32>,
    pub final_score: Option<f32>,
    pub cross_encoder_score: Option<f32>,
    pub mmr_score: Option<f32>,
    pub source: SearchSource,
}

impl RetrievalResult {
    pub fn new(id: ChunkId, text: impl Into<String>, score: f32, source: SearchSource) -> Self {
        Self {
            id,
            text: text.into(),
            metadata: ChunkMetadata::default(),
            meta_card: None,
            embedding: None,
            score,
            dense_score: None,
            bm25_score: None,
            final_score: None,
            cross_encoder_score: None,
            mmr_score: None,
            source,
        }
    }

    pub fn from_chunk(chunk: &Chunk, score: f32, source: SearchSource) -> Self {
        Self {
            metadata: chunk.metadata.clone(),
            meta_card: chunk.meta_card.clone(),
            embedding: chunk.embedding.clone(),
            ..Self::new(chunk.id.clone(), chunk.text.clone(), score, source)
        }
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta_card(mut self, card: MetaCard) -> Self {
        self.meta_card = Some(card);
        self
    }

    pub fn with_final_score(mut self, score: f32) -> Self {
        self.final_score = Some(score);
        self
    }

    /// Authoritative ranking signal
    ///
    /// Priority: `final_score`, then `cross_encoder_score`, then the raw
    /// `score`, then 0. A more generic field never masks a more specific one.
    pub fn effective_score(&self) -> f32 {
        let score = self
            .final_score
            .or(self.cross_encoder_score)
            .unwrap_or(self.score);
        if score.is_finite() {
            score
        } else {
            0.0
        }
    }

    /// Dedup key used by hybrid fusion
    pub fn fusion_key(&self) -> String {
        self.metadata
            .source_id
            .clone()
            .unwrap_or_else(|| self.id.as_str().to_string())
    }
}

/// How a parent block was assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// Ordered children merged with overlap trimming
    Contiguous,
    /// Best children joined with a delimiter
    Concatenated,
    /// Single largest child after a build failure
    LargestChild,
}

/// A child fragment inside a parent block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub id: ChunkId,
    pub score: f32,
    pub position: Option<u32>,
}

/// Reconstituted context block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentBlock {
    pub parent_id: String,
    pub text: String,
    pub tokens: usize,
    pub child_count: usize,
    pub aggregated_score: f32,
    /// Best child's metadata with tags unioned across children
    pub metadata: ChunkMetadata,
    /// Distinct source ids across children
    pub sources: Vec<String>,
    pub meta_card: Option<MetaCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub children: Vec<ChildRef>,
    pub build_mode: BuildMode,
}

impl ParentBlock {
    /// View the block as a retrieval result for context building
    pub fn to_result(&self) -> RetrievalResult {
        RetrievalResult {
            metadata: self.metadata.clone(),
            meta_card: self.meta_card.clone(),
            embedding: self.embedding.clone(),
            final_score: Some(self.aggregated_score),
            ..RetrievalResult::new(
                ChunkId::new(self.parent_id.clone()),
                self.text.clone(),
                self.aggregated_score,
                SearchSource::Aggregated,
            )
        }
    }
}
