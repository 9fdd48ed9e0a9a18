//! Centralized constants for the grounding engine
//!
//! Single source of truth for every default used across the workspace.
//! Settings defaults and component `Default` impls both read from here.

/// BM25 keyword index defaults
pub mod keyword {
    /// Term-frequency saturation
    pub const K1: f32 = 1.2;

    /// Document-length normalization
    pub const B: f32 = 0.75;

    /// Results scoring below this are dropped
    pub const MIN_SCORE: f32 = 0.1;

    /// Longest CJK run emitted as a whole token
    pub const MAX_CJK_RUN: usize = 8;
}

/// Vector store defaults
pub mod vector {
    /// Embedding dimension (e5-small / MiniLM class models)
    pub const DIMENSION: usize = 384;
}

/// Hybrid fusion defaults
pub mod fusion {
    /// Base dense (semantic) weight
    pub const DENSE_WEIGHT: f32 = 0.7;

    /// Base keyword weight
    pub const KEYWORD_WEIGHT: f32 = 0.3;

    /// Floor for the dense weight after intent adjustments
    pub const MIN_DENSE_WEIGHT: f32 = 0.2;

    /// Upper bound accepted for `min_dense_weight` so contract lookups keep
    /// keyword weight at or above 0.7
    pub const MAX_MIN_DENSE_WEIGHT: f32 = 0.3;

    /// Keyword weight per intent
    pub const CONTRACT_ADDRESS_KEYWORD_WEIGHT: f32 = 0.8;
    pub const TICKER_KEYWORD_WEIGHT: f32 = 0.75;
    pub const OFFICIAL_CHANNEL_KEYWORD_WEIGHT: f32 = 0.65;
    pub const TECHNICAL_SPECS_KEYWORD_WEIGHT: f32 = 0.45;

    /// Keyword boost per detected exact signal, and its cap
    pub const SIGNAL_BOOST_PER_SIGNAL: f32 = 0.1;
    pub const SIGNAL_BOOST_CAP: f32 = 0.2;
}

/// Retrieval orchestration defaults
pub mod retrieval {
    pub const DENSE_TOP_K: usize = 20;
    pub const KEYWORD_TOP_K: usize = 20;
    pub const FINAL_TOP_K: usize = 8;

    /// Absolute score floor after filtering
    pub const MIN_SCORE: f32 = 0.05;

    /// Volatile chunks older than this are down-weighted
    pub const STALENESS_DAYS: i64 = 7;
    pub const STALENESS_PENALTY: f32 = 0.5;

    /// Share of the fused score kept after relevance reranking; the
    /// relevance score gets the complement
    pub const RERANK_PRIOR_WEIGHT: f32 = 0.3;

    /// Integration statuses accepted for support lookups
    pub const ACCEPTED_INTEGRATION_STATUSES: &[&str] = &["beta", "live"];
}

/// Relevance reranker defaults
pub mod reranker {
    pub const BATCH_SIZE: usize = 16;

    /// Per-batch model timeout (ms)
    pub const MODEL_TIMEOUT_MS: u64 = 2_000;

    /// Fallback scorer weights
    pub const PHRASE_WEIGHT: f32 = 0.4;
    pub const OVERLAP_WEIGHT: f32 = 0.3;
    pub const PROXIMITY_WEIGHT: f32 = 0.2;
    pub const PRIOR_WEIGHT: f32 = 0.1;

    /// Query terms shorter than this are ignored by the overlap signal
    pub const MIN_TERM_LEN: usize = 3;

    /// Maximum sequence length for cross-encoder input
    pub const MAX_SEQ_LEN: usize = 256;
}

/// Parent/child aggregation defaults
pub mod aggregation {
    pub const MAX_WEIGHT: f32 = 0.7;
    pub const MEAN_WEIGHT: f32 = 0.3;

    pub const MULTI_HIT_BONUS_PER_CHILD: f32 = 0.1;
    pub const MULTI_HIT_BONUS_CAP: f32 = 0.3;

    pub const META_CARD_BASE_BONUS: f32 = 0.05;
    pub const META_CARD_INTENT_BONUS: f32 = 0.05;
    pub const META_CARD_BONUS_CAP: f32 = 0.15;

    pub const MIN_PARENT_TOKENS: usize = 80;
    pub const MAX_PARENT_TOKENS: usize = 800;
    pub const MAX_PARENTS: usize = 5;

    /// Sentences compared when trimming overlap between neighbours
    pub const OVERLAP_SENTENCES: usize = 3;

    pub const CONCAT_DELIMITER: &str = "\n\n---\n\n";
}

/// Context builder defaults
pub mod context {
    pub const TOTAL_TOKENS: usize = 4096;
    pub const SYSTEM_PROMPT_TOKENS: usize = 400;
    pub const QUERY_TOKENS: usize = 150;
    pub const HISTORY_TOKENS: usize = 600;
    pub const KNOWLEDGE_TOKENS: usize = 2500;

    pub const MIN_CHUNK_TOKENS: usize = 100;
    pub const MAX_CHUNKS: usize = 8;

    pub const PRE_CAP_PER_SOURCE: usize = 2;
    pub const POST_CAP_PER_SOURCE: usize = 1;

    /// Chunks above this estimate count as complete enough
    pub const COMPLETE_ENOUGH_TOKENS: usize = 50;

    /// Cosine similarity for semantic clustering
    pub const CLUSTER_THRESHOLD: f32 = 0.92;

    /// Representative selection weights
    pub const REP_SCORE_WEIGHT: f32 = 0.35;
    pub const REP_LENGTH_WEIGHT: f32 = 0.25;
    pub const REP_METADATA_WEIGHT: f32 = 0.15;
    pub const REP_KEYWORD_WEIGHT: f32 = 0.10;
    pub const REP_META_CARD_WEIGHT: f32 = 0.15;
    pub const REP_INTENT_BOOST: f32 = 0.1;

    /// Leading characters compared by the near-duplicate fallback
    pub const NEAR_DUP_PREFIX_CHARS: usize = 200;
}

/// Observability defaults
pub mod observability {
    pub const LOG_LEVEL: &str = "info";
}
