//! Semantic retriever
//!
//! Query analysis, concurrent dense + keyword search with intent-aware
//! fusion, relevance reranking, metadata filtering and optional parent
//! aggregation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use grounding_config::constants::retrieval as defaults;
use grounding_config::RetrievalSettings;
use grounding_core::{
    Chunk, DiversityReranker, Embedder, IntentKind, ParentBlock, QueryAnalysis, RetrievalResult,
    RetrieveOptions, Retriever,
};
use parking_lot::RwLock;
use serde::Serialize;

use crate::aggregator::ParentAggregator;
use crate::fusion::{calculate_dynamic_weights, fuse, FusionConfig, FusionWeights};
use crate::keyword_index::{IndexStats, KeywordIndex, PinnedKeywordIndex};
use crate::query_analysis::QueryAnalyzer;
use crate::reranker::RelevanceReranker;
use crate::telemetry::{increment_counter, record_degraded, record_stage_latency, DegradedStage};
use crate::vector_store::{VectorGeneration, VectorStore};
use crate::RagError;

/// Candidate pool handed to the diversity reranker, as a multiple of top-k
const DIVERSITY_POOL_FACTOR: usize = 2;

/// Retriever configuration
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Candidates from dense search
    pub dense_top_k: usize,
    /// Candidates from keyword search
    pub keyword_top_k: usize,
    pub final_top_k: usize,
    pub min_score: f32,
    pub fusion: FusionConfig,
    /// Volatile chunks older than this many days are penalized
    pub staleness_days: i64,
    pub staleness_penalty: f32,
    /// Share of the fused score kept after relevance reranking
    pub rerank_prior_weight: f32,
    /// Aggregate into parent blocks by default
    pub aggregate: bool,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            dense_top_k: defaults::DENSE_TOP_K,
            keyword_top_k: defaults::KEYWORD_TOP_K,
            final_top_k: defaults::FINAL_TOP_K,
            min_score: defaults::MIN_SCORE,
            fusion: FusionConfig::default(),
            staleness_days: defaults::STALENESS_DAYS,
            staleness_penalty: defaults::STALENESS_PENALTY,
            rerank_prior_weight: defaults::RERANK_PRIOR_WEIGHT,
            aggregate: false,
        }
    }
}

impl From<&RetrievalSettings> for RetrieverConfig {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            dense_top_k: settings.dense_top_k,
            keyword_top_k: settings.keyword_top_k,
            final_top_k: settings.final_top_k,
            min_score: settings.min_score,
            fusion: FusionConfig::from(settings),
            staleness_days: settings.staleness_days,
            staleness_penalty: settings.staleness_penalty,
            rerank_prior_weight: settings.rerank_prior_weight,
            aggregate: settings.aggregate,
        }
    }
}

/// Everything one retrieval produced
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub analysis: QueryAnalysis,
    pub weights: FusionWeights,
    /// Filtered fragment-level results, best first
    pub results: Vec<RetrievalResult>,
    /// Parent blocks when aggregation ran
    pub parent_blocks: Vec<ParentBlock>,
    /// Optional stages that fell back
    pub degraded: Vec<DegradedStage>,
}

impl RetrievalOutcome {
    /// Results to hand to the context builder: parent blocks when present
    pub fn context_candidates(&self) -> Vec<RetrievalResult> {
        if self.parent_blocks.is_empty() {
            self.results.clone()
        } else {
            self.parent_blocks.iter().map(ParentBlock::to_result).collect()
        }
    }
}

/// Hybrid keyword + dense retriever
pub struct SemanticRetriever {
    config: RetrieverConfig,
    keyword_index: Arc<KeywordIndex>,
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    analyzer: QueryAnalyzer,
    reranker: Option<Arc<RelevanceReranker>>,
    diversity: Option<Arc<dyn DiversityReranker>>,
    aggregator: ParentAggregator,
    /// Held for writing while both indexes swap generations
    publish_gate: RwLock<()>,
}

impl SemanticRetriever {
    pub fn new(
        config: RetrieverConfig,
        keyword_index: Arc<KeywordIndex>,
        vector_store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            keyword_index,
            vector_store,
            embedder,
            analyzer: QueryAnalyzer::new(),
            reranker: None,
            diversity: None,
            aggregator: ParentAggregator::default(),
            publish_gate: RwLock::new(()),
        }
    }

    pub fn with_analyzer(mut self, analyzer: QueryAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<RelevanceReranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_diversity(mut self, diversity: Arc<dyn DiversityReranker>) -> Self {
        self.diversity = Some(diversity);
        self
    }

    pub fn with_aggregator(mut self, aggregator: ParentAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn reranker(&self) -> Option<&Arc<RelevanceReranker>> {
        self.reranker.as_ref()
    }

    /// Replace the corpus of both indexes
    ///
    /// Both generations are built before either is swapped in, and the swaps
    /// happen together, so a concurrent retrieval sees the old corpus or the
    /// new one, never a mix. A bad embedding leaves both indexes untouched.
    pub fn replace_corpus(&self, chunks: &[Chunk]) -> Result<IndexStats, RagError> {
        let vectors = self.vector_store.prepare(chunks)?;
        let keyword = KeywordIndex::prepare(chunks);

        let _publish = self.publish_gate.write();
        self.vector_store.publish(vectors);
        Ok(self.keyword_index.publish(keyword))
    }

    fn pin_indexes(&self) -> (Arc<VectorGeneration>, Option<PinnedKeywordIndex>) {
        let _publish = self.publish_gate.read();
        (self.vector_store.pin(), self.keyword_index.pin())
    }

    /// Analyze the query: exact signals, glossary expansion, intents
    pub fn prepare_query(&self, query: &str) -> QueryAnalysis {
        self.analyzer.analyze(query)
    }

    /// Dense search always, keyword search when the analysis asks for it,
    /// both concurrently, then weighted fusion
    pub async fn perform_hybrid_retrieval(
        &self,
        analysis: &QueryAnalysis,
        weights: FusionWeights,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        let start = Instant::now();
        let (vectors, keyword_index) = self.pin_indexes();

        let dense_future = async {
            let embedding = self.embedder.embed(&analysis.expanded).await?;
            let generation = Arc::clone(&vectors);
            let k = self.config.dense_top_k;
            tokio::task::spawn_blocking(move || generation.search(&embedding, k, None)).await?
        };

        let keyword_future = async {
            if !analysis.needs_keyword_search {
                return Ok(Vec::new());
            }
            let index = keyword_index.clone().ok_or(RagError::IndexNotBuilt)?;
            let query = analysis.expanded.clone();
            let k = self.config.keyword_top_k;
            Ok::<_, RagError>(tokio::task::spawn_blocking(move || index.search(&query, k)).await?)
        };

        let (dense, keyword) = tokio::join!(dense_future, keyword_future);
        let dense = dense?;
        let keyword = keyword?;

        let dense_hits = dense.len();
        let keyword_hits = keyword.len();
        let fused = fuse(dense, keyword, weights);

        tracing::debug!(
            dense_hits,
            keyword_hits,
            fused = fused.len(),
            dense_weight = weights.dense,
            keyword_weight = weights.keyword,
            "Hybrid retrieval"
        );
        record_stage_latency("hybrid", start.elapsed());
        Ok(fused)
    }

    /// Relevance reranking then optional diversity selection
    ///
    /// After relevance scoring the final score is
    /// `prior * fused + (1 - prior) * relevance`.
    pub async fn rerank_results(
        &self,
        query: &str,
        results: Vec<RetrievalResult>,
        target: usize,
        degraded: &mut Vec<DegradedStage>,
    ) -> Vec<RetrievalResult> {
        let start = Instant::now();
        let mut results = results;

        if let Some(reranker) = &self.reranker {
            if reranker.model_load_failed() {
                degraded.push(DegradedStage::ModelLoad);
            }
            let reranked = reranker.rerank(query, results).await;
            if reranked.fallback_batches > 0 {
                degraded.push(DegradedStage::ModelBatch);
            }

            let prior = self.config.rerank_prior_weight.clamp(0.0, 1.0);
            results = reranked
                .results
                .into_iter()
                .map(|mut r| {
                    let fused = r.final_score.unwrap_or(r.score);
                    let relevance = r.cross_encoder_score.unwrap_or(0.0);
                    r.final_score = Some(prior * fused + (1.0 - prior) * relevance);
                    r
                })
                .collect();
            sort_by_effective_score(&mut results);
        }

        if let Some(diversity) = &self.diversity {
            let pool = target.saturating_mul(DIVERSITY_POOL_FACTOR).max(1);
            match diversity.select(query, results.clone(), pool).await {
                Ok(selected) => results = selected,
                Err(e) => {
                    tracing::warn!(error = %e, "Diversity reranker failed, keeping relevance order");
                    record_degraded(DegradedStage::Diversity);
                    degraded.push(DegradedStage::Diversity);
                },
            }
        }

        record_stage_latency("rerank", start.elapsed());
        results
    }

    /// Intent-aware filtering, staleness penalty, score floor and top-k
    pub fn apply_metadata_filters(
        &self,
        results: Vec<RetrievalResult>,
        analysis: &QueryAnalysis,
        min_score: f32,
        top_k: usize,
    ) -> Vec<RetrievalResult> {
        self.filter_as_of(results, analysis, min_score, top_k, Utc::now().date_naive())
    }

    fn filter_as_of(
        &self,
        results: Vec<RetrievalResult>,
        analysis: &QueryAnalysis,
        min_score: f32,
        top_k: usize,
        today: NaiveDate,
    ) -> Vec<RetrievalResult> {
        let support = analysis.is_support_lookup();
        let technical = analysis.has_intent(IntentKind::TechnicalSpecs);
        let before = results.len();

        let mut kept: Vec<RetrievalResult> = results
            .into_iter()
            .filter(|r| !(support && is_unverified_integration(r)))
            .filter(|r| !(technical && r.metadata.exclude_from_tech))
            .map(|r| self.penalize_stale(r, today))
            .filter(|r| r.effective_score() >= min_score)
            .collect();

        sort_by_effective_score(&mut kept);
        kept.truncate(top_k);

        tracing::debug!(before, after = kept.len(), support, technical, "Metadata filters");
        kept
    }

    fn penalize_stale(&self, mut result: RetrievalResult, today: NaiveDate) -> RetrievalResult {
        let stale = result.metadata.is_volatile()
            && result
                .metadata
                .as_of
                .is_some_and(|as_of| (today - as_of).num_days() > self.config.staleness_days);
        if stale {
            let penalized = result.effective_score() * self.config.staleness_penalty;
            result.final_score = Some(penalized);
        }
        result
    }

    /// Full pipeline with configured defaults
    pub async fn retrieve(&self, query: &str) -> Result<RetrievalOutcome, RagError> {
        let options = RetrieveOptions {
            top_k: self.config.final_top_k,
            min_score: self.config.min_score,
            rerank: true,
            aggregate: self.config.aggregate,
        };
        self.retrieve_with(query, &options).await
    }

    /// Full pipeline: analysis, hybrid search, rerank, filter, aggregate
    pub async fn retrieve_with(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<RetrievalOutcome, RagError> {
        let start = Instant::now();
        increment_counter("grounding_rag_retrievals_total");

        let analysis = self.prepare_query(query);
        let weights = calculate_dynamic_weights(&analysis, &self.config.fusion);
        let mut degraded = Vec::new();

        let fused = self.perform_hybrid_retrieval(&analysis, weights).await?;

        let reranked = if options.rerank {
            self.rerank_results(query, fused, options.top_k, &mut degraded).await
        } else {
            fused
        };

        let min_score = options.min_score.max(self.config.min_score);
        let results = self.apply_metadata_filters(reranked, &analysis, min_score, options.top_k);

        let parent_blocks = if options.aggregate || self.config.aggregate {
            let outcome = self
                .aggregator
                .aggregate_to_parents(&results, &analysis.intent_kinds());
            if outcome.fallbacks > 0 {
                degraded.push(DegradedStage::ParentBuild);
            }
            outcome.blocks
        } else {
            Vec::new()
        };

        tracing::debug!(
            results = results.len(),
            parents = parent_blocks.len(),
            degraded = degraded.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieval complete"
        );
        record_stage_latency("retrieve", start.elapsed());

        Ok(RetrievalOutcome {
            analysis,
            weights,
            results,
            parent_blocks,
            degraded,
        })
    }
}

#[async_trait]
impl Retriever for SemanticRetriever {
    async fn retrieve(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> grounding_core::Result<Vec<RetrievalResult>> {
        let outcome = self.retrieve_with(query, options).await?;
        if options.aggregate && !outcome.parent_blocks.is_empty() {
            return Ok(outcome.context_candidates());
        }
        Ok(outcome.results)
    }

    fn name(&self) -> &str {
        "semantic"
    }
}

/// Integration chunks must be verified and in an accepted status
fn is_unverified_integration(result: &RetrievalResult) -> bool {
    let meta = &result.metadata;
    let is_integration = meta
        .kind
        .as_deref()
        .is_some_and(|k| k.eq_ignore_ascii_case("integration"));
    if !is_integration {
        return false;
    }

    let verified = meta.verified == Some(true);
    let accepted = meta.status.as_deref().is_some_and(|s| {
        defaults::ACCEPTED_INTEGRATION_STATUSES
            .iter()
            .any(|a| a.eq_ignore_ascii_case(s))
    });
    !(verified && accepted)
}

fn sort_by_effective_score(results: &mut [RetrievalResult]) {
    results.sort_by(|a, b| {
        b.effective_score()
            .total_cmp(&a.effective_score())
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounding_core::{Chunk, ChunkId, ChunkMetadata, SearchSource};

    use crate::keyword_index::KeywordConfig;
    use crate::vector_store::VectorStoreConfig;

    /// Deterministic 4-d embedding keyed on a few words
    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(&self, text: &str) -> grounding_core::Result<Vec<f32>> {
            Ok(embed_words(text))
        }

        fn dimension(&self) -> usize {
            4
        }
    }

    fn embed_words(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v = vec![0.05f32; 4];
        for (i, word) in ["staking", "bridge", "token", "fees"].iter().enumerate() {
            if lower.contains(word) {
                v[i] += 1.0;
            }
        }
        v
    }

    fn chunk(id: &str, text: &str, meta: ChunkMetadata) -> Chunk {
        Chunk::new(ChunkId::new(id), text)
            .with_search_text(text)
            .with_embedding(embed_words(text))
            .with_metadata(meta)
    }

    fn retriever(chunks: &[Chunk]) -> SemanticRetriever {
        let index = Arc::new(KeywordIndex::new(KeywordConfig::default()));
        index.build_index(chunks);
        let store = Arc::new(VectorStore::new(VectorStoreConfig {
            dimension: 4,
            ..Default::default()
        }));
        store.add_batch(chunks).unwrap();
        SemanticRetriever::new(RetrieverConfig::default(), index, store, Arc::new(WordEmbedder))
    }

    fn scored(id: &str, score: f32, meta: ChunkMetadata) -> RetrievalResult {
        RetrievalResult::new(ChunkId::new(id), "text", score, SearchSource::Hybrid)
            .with_metadata(meta)
            .with_final_score(score)
    }

    fn analysis_for(query: &str) -> QueryAnalysis {
        QueryAnalyzer::new().analyze(query)
    }

    #[tokio::test]
    async fn test_dense_only_for_plain_query() {
        let chunks = vec![
            chunk("s", "Staking rewards are paid daily", ChunkMetadata::new()),
            chunk("b", "The bridge connects two chains", ChunkMetadata::new()),
        ];
        let retriever = retriever(&chunks);

        let outcome = retriever.retrieve("how does staking work").await.unwrap();
        assert!(!outcome.analysis.needs_keyword_search);
        assert_eq!(outcome.results[0].id.as_str(), "s");
        assert_eq!(outcome.results[0].source, SearchSource::Dense);
    }

    #[tokio::test]
    async fn test_ticker_query_uses_keyword_search() {
        let chunks = vec![
            chunk("ticker", "The $ZETA token trades on major venues", ChunkMetadata::new()),
            chunk("other", "token staking and token fees explained", ChunkMetadata::new()),
        ];
        let retriever = retriever(&chunks);

        let outcome = retriever.retrieve("what is $ZETA token").await.unwrap();
        assert!(outcome.analysis.needs_keyword_search);
        assert!(outcome.weights.keyword >= 0.75);
        assert_eq!(outcome.results[0].id.as_str(), "ticker");
    }

    #[tokio::test]
    async fn test_keyword_search_before_build_is_fatal() {
        let index = Arc::new(KeywordIndex::default());
        let store = Arc::new(VectorStore::new(VectorStoreConfig {
            dimension: 4,
            ..Default::default()
        }));
        let retriever =
            SemanticRetriever::new(RetrieverConfig::default(), index, store, Arc::new(WordEmbedder));

        let err = retriever.retrieve("price of $ZETA").await.unwrap_err();
        assert!(matches!(err, RagError::IndexNotBuilt));
    }

    #[test]
    fn test_support_lookup_drops_unverified_integrations() {
        let retriever = retriever(&[]);
        let integration = |verified: Option<bool>, status: &str| ChunkMetadata {
            kind: Some("integration".into()),
            verified,
            status: Some(status.into()),
            ..Default::default()
        };
        let results = vec![
            scored("live", 0.9, integration(Some(true), "live")),
            scored("beta", 0.8, integration(Some(true), "beta")),
            scored("unverified", 0.7, integration(None, "live")),
            scored("deprecated", 0.6, integration(Some(true), "deprecated")),
            scored("doc", 0.5, ChunkMetadata::new()),
        ];

        let analysis = analysis_for("official telegram channel");
        assert!(analysis.is_support_lookup());
        let kept = retriever.apply_metadata_filters(results.clone(), &analysis, 0.0, 10);
        let ids: Vec<&str> = kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["live", "beta", "doc"]);

        // Other intents keep everything
        let kept = retriever.apply_metadata_filters(results, &analysis_for("bridge"), 0.0, 10);
        assert_eq!(kept.len(), 5);
    }

    #[test]
    fn test_technical_intent_drops_excluded() {
        let retriever = retriever(&[]);
        let excluded = ChunkMetadata {
            exclude_from_tech: true,
            ..Default::default()
        };
        let results = vec![scored("x", 0.9, excluded), scored("y", 0.5, ChunkMetadata::new())];

        let analysis = analysis_for("consensus latency specification");
        assert!(analysis.has_intent(IntentKind::TechnicalSpecs));
        let kept = retriever.apply_metadata_filters(results, &analysis, 0.0, 10);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id.as_str(), "y");
    }

    #[test]
    fn test_staleness_penalty_and_floor() {
        let retriever = retriever(&[]);
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let volatile = |days_old: i64| ChunkMetadata {
            volatile: true,
            as_of: Some(today - chrono::Duration::days(days_old)),
            ..Default::default()
        };
        let results = vec![
            scored("fresh", 0.6, volatile(3)),
            scored("stale", 0.8, volatile(30)),
            scored("stable", 0.5, ChunkMetadata::new()),
            scored("weak", 0.01, ChunkMetadata::new()),
        ];

        let kept = retriever.filter_as_of(results, &analysis_for("anything"), 0.05, 10, today);
        let ids: Vec<&str> = kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "stable", "stale"]);
        assert!((kept[2].effective_score() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_filters_truncate_to_top_k() {
        let retriever = retriever(&[]);
        let results = (0..10)
            .map(|i| scored(&format!("r{}", i), 0.9 - i as f32 * 0.05, ChunkMetadata::new()))
            .collect();
        let kept = retriever.apply_metadata_filters(results, &analysis_for("x"), 0.0, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].id.as_str(), "r0");
    }

    #[tokio::test]
    async fn test_rerank_blend() {
        let chunks = vec![chunk("s", "staking rewards", ChunkMetadata::new())];
        let retriever = retriever(&chunks).with_reranker(Arc::new(RelevanceReranker::default()));

        let fused = vec![scored("a", 0.5, ChunkMetadata::new())];
        let mut degraded = Vec::new();
        let out = retriever.rerank_results("text", fused, 5, &mut degraded).await;

        let relevance = out[0].cross_encoder_score.unwrap();
        let expected = 0.3 * 0.5 + 0.7 * relevance;
        assert!((out[0].effective_score() - expected).abs() < 1e-5);
        assert!(degraded.is_empty());
    }

    #[tokio::test]
    async fn test_aggregated_outcome() {
        let chunks = vec![
            chunk(
                "guide#p1",
                "Staking guide part one.",
                ChunkMetadata::new().with_parent(ChunkId::new("guide"), Some(1)),
            ),
            chunk(
                "guide#p2",
                "Staking guide part two.",
                ChunkMetadata::new().with_parent(ChunkId::new("guide"), Some(2)),
            ),
        ];
        let retriever = retriever(&chunks);
        let options = RetrieveOptions::default().aggregated().without_rerank();

        let outcome = retriever.retrieve_with("staking", &options).await.unwrap();
        assert_eq!(outcome.parent_blocks.len(), 1);
        assert_eq!(outcome.parent_blocks[0].child_count, 2);

        let flat = Retriever::retrieve(&retriever, "staking", &options).await.unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].source, SearchSource::Aggregated);
    }
}
