//! Relevance reranker
//!
//! Scores `(query, passage)` pairs with an injected [`RelevanceModel`] when
//! one is available. Model batches run sequentially, each bounded by a
//! timeout. A batch that fails, times out or returns a malformed score list
//! is scored by [`FallbackScorer`] instead; the rest of the request keeps
//! using the model.
//!
//! ## Fallback signals
//!
//! | signal    | weight | meaning                                              |
//! |-----------|--------|------------------------------------------------------|
//! | phrase    | 0.4    | full query phrase contained, else share of adjacent query-term pairs found contiguously |
//! | overlap   | 0.3    | share of query terms (len >= 3) present              |
//! | proximity | 0.2    | `1 / (1 + avg pairwise distance / 4)` of first matches |
//! | prior     | 0.1    | retrieval score clamped to [0, 1]                    |

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use grounding_config::constants::reranker;
use grounding_config::RerankerSettings;
use grounding_core::{RelevanceModel, RetrievalResult};

use crate::telemetry::{record_degraded, DegradedStage};
use crate::tokenizer::{contains_cjk, token_stream, tokenize};

/// Reranker configuration
#[derive(Debug, Clone)]
pub struct RerankerConfig {
    /// Pairs per model call
    pub batch_size: usize,
    /// Upper bound for one model batch
    pub model_timeout: Duration,
    /// Maximum sequence length for model input
    pub max_seq_len: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            batch_size: reranker::BATCH_SIZE,
            model_timeout: Duration::from_millis(reranker::MODEL_TIMEOUT_MS),
            max_seq_len: reranker::MAX_SEQ_LEN,
        }
    }
}

impl From<&RerankerSettings> for RerankerConfig {
    fn from(settings: &RerankerSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            model_timeout: Duration::from_millis(settings.model_timeout_ms),
            max_seq_len: settings.max_seq_len,
        }
    }
}

/// Reranker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RerankerStats {
    /// Total rerank calls
    pub total_calls: usize,
    /// Total passages scored
    pub total_docs: usize,
    /// Passages scored by the model
    pub model_docs: usize,
    /// Passages scored by the fallback
    pub fallback_docs: usize,
    /// Model batches replaced by the fallback
    pub fallback_batches: usize,
    /// Of those, batches that hit the timeout
    pub timeouts: usize,
}

/// Output of one rerank call
#[derive(Debug, Clone)]
pub struct Reranked {
    /// Sorted by relevance, highest first; `cross_encoder_score` is set
    pub results: Vec<RetrievalResult>,
    /// Model batches that fell back during this call
    pub fallback_batches: usize,
}

/// Deterministic multi-signal relevance scorer
pub struct FallbackScorer;

impl FallbackScorer {
    /// Score one passage; `prior` is its retrieval score
    pub fn score(query: &str, passage: &str, prior: f32) -> f32 {
        let query_terms = tokenize(query);
        let passage_tokens = token_stream(passage);

        let phrase = Self::phrase_score(query, &query_terms, passage, &passage_tokens);
        let overlap = Self::overlap_score(&query_terms, &passage_tokens);
        let proximity = Self::proximity_score(&query_terms, &passage_tokens);
        let prior = if prior.is_finite() {
            prior.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let score = reranker::PHRASE_WEIGHT * phrase
            + reranker::OVERLAP_WEIGHT * overlap
            + reranker::PROXIMITY_WEIGHT * proximity
            + reranker::PRIOR_WEIGHT * prior;
        score.clamp(0.0, 1.0)
    }

    /// 1.0 for full containment, else the share of adjacent query-term
    /// pairs that appear next to each other in the passage
    pub fn phrase_score(
        query: &str,
        query_terms: &[String],
        passage: &str,
        passage_tokens: &[String],
    ) -> f32 {
        let query_norm = collapse(query);
        if query_norm.is_empty() || query_terms.is_empty() {
            return 0.0;
        }
        if collapse(passage).contains(&query_norm) {
            return 1.0;
        }
        if query_terms.len() < 2 {
            return 0.0;
        }

        let passage_pairs: HashSet<(&str, &str)> = passage_tokens
            .windows(2)
            .map(|w| (w[0].as_str(), w[1].as_str()))
            .collect();
        let pairs = query_terms.len() - 1;
        let found = query_terms
            .windows(2)
            .filter(|w| passage_pairs.contains(&(w[0].as_str(), w[1].as_str())))
            .count();

        found as f32 / pairs as f32
    }

    /// Share of significant query terms present in the passage
    pub fn overlap_score(query_terms: &[String], passage_tokens: &[String]) -> f32 {
        let significant: Vec<&String> = query_terms
            .iter()
            .filter(|t| t.chars().count() >= reranker::MIN_TERM_LEN || contains_cjk(t))
            .collect();
        if significant.is_empty() {
            return 0.0;
        }

        let present: HashSet<&str> = passage_tokens.iter().map(String::as_str).collect();
        let hits = significant
            .iter()
            .filter(|t| present.contains(t.as_str()))
            .count();

        hits as f32 / significant.len() as f32
    }

    /// Inverted average pairwise distance between first matches
    pub fn proximity_score(query_terms: &[String], passage_tokens: &[String]) -> f32 {
        let mut first_positions: HashMap<&str, usize> = HashMap::new();
        for (pos, token) in passage_tokens.iter().enumerate() {
            first_positions.entry(token.as_str()).or_insert(pos);
        }

        let positions: Vec<usize> = query_terms
            .iter()
            .filter_map(|t| first_positions.get(t.as_str()).copied())
            .collect();

        match positions.len() {
            0 => 0.0,
            1 => 1.0,
            n => {
                let mut total = 0usize;
                for i in 0..n {
                    for j in (i + 1)..n {
                        total += positions[i].abs_diff(positions[j]);
                    }
                }
                let pairs = n * (n - 1) / 2;
                let avg = total as f32 / pairs as f32;
                1.0 / (1.0 + avg / 4.0)
            },
        }
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Relevance reranker with an optional model
pub struct RelevanceReranker {
    config: RerankerConfig,
    model: Option<Arc<dyn RelevanceModel>>,
    /// A model was configured but could not be loaded
    model_load_failed: bool,
    stats: Mutex<RerankerStats>,
}

impl RelevanceReranker {
    /// Reranker that only uses the fallback scorer
    pub fn new(config: RerankerConfig) -> Self {
        Self {
            config,
            model: None,
            model_load_failed: false,
            stats: Mutex::new(RerankerStats::default()),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn RelevanceModel>) -> Self {
        self.model = Some(model);
        self.model_load_failed = false;
        self
    }

    /// Mark the configured model as unavailable; every rerank then runs on
    /// the fallback scorer and retrievals report it as degraded
    pub fn with_model_load_failure(mut self) -> Self {
        self.model_load_failed = true;
        self
    }

    pub fn model_load_failed(&self) -> bool {
        self.model_load_failed
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn config(&self) -> &RerankerConfig {
        &self.config
    }

    /// Score and reorder `results`
    pub async fn rerank(&self, query: &str, results: Vec<RetrievalResult>) -> Reranked {
        if results.is_empty() {
            return Reranked {
                results,
                fallback_batches: 0,
            };
        }

        let (scores, fallback_batches) = self.score_all(query, &results).await;

        let mut results: Vec<RetrievalResult> = results
            .into_iter()
            .zip(scores)
            .map(|(mut result, score)| {
                result.cross_encoder_score = Some(score);
                result
            })
            .collect();

        results.sort_by(|x, y| {
            let xs = x.cross_encoder_score.unwrap_or(0.0);
            let ys = y.cross_encoder_score.unwrap_or(0.0);
            ys.total_cmp(&xs).then_with(|| x.id.cmp(&y.id))
        });

        Reranked {
            results,
            fallback_batches,
        }
    }

    /// One relevance score per result, in input order
    async fn score_all(&self, query: &str, results: &[RetrievalResult]) -> (Vec<f32>, usize) {
        let mut scores = Vec::with_capacity(results.len());
        let mut fallback_batches = 0usize;
        let mut timeouts = 0usize;
        let mut model_docs = 0usize;

        let Some(model) = self.model.as_ref() else {
            scores.extend(results.iter().map(|r| Self::fallback(query, r)));
            self.update_stats(results.len(), 0, 0, 0);
            return (scores, 0);
        };

        for batch in results.chunks(self.config.batch_size.max(1)) {
            let passages: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();

            let outcome =
                tokio::time::timeout(self.config.model_timeout, model.score_batch(query, &passages))
                    .await;

            let model_scores = match outcome {
                Ok(Ok(batch_scores)) if batch_scores.len() == batch.len() => Some(batch_scores),
                Ok(Ok(batch_scores)) => {
                    tracing::warn!(
                        model = model.name(),
                        expected = batch.len(),
                        actual = batch_scores.len(),
                        "Relevance model returned wrong score count, using fallback"
                    );
                    None
                },
                Ok(Err(e)) => {
                    tracing::warn!(model = model.name(), error = %e, "Relevance batch failed, using fallback");
                    None
                },
                Err(_) => {
                    tracing::warn!(
                        model = model.name(),
                        timeout_ms = self.config.model_timeout.as_millis() as u64,
                        "Relevance batch timed out, using fallback"
                    );
                    timeouts += 1;
                    None
                },
            };

            match model_scores {
                Some(batch_scores) => {
                    model_docs += batch.len();
                    scores.extend(batch_scores.into_iter().map(|s| {
                        if s.is_finite() {
                            s.clamp(0.0, 1.0)
                        } else {
                            0.0
                        }
                    }));
                },
                None => {
                    fallback_batches += 1;
                    record_degraded(DegradedStage::ModelBatch);
                    scores.extend(batch.iter().map(|r| Self::fallback(query, r)));
                },
            }
        }

        self.update_stats(results.len(), model_docs, fallback_batches, timeouts);
        tracing::debug!(
            docs = results.len(),
            model_docs,
            fallback_batches,
            "Reranked with relevance model"
        );

        (scores, fallback_batches)
    }

    fn fallback(query: &str, result: &RetrievalResult) -> f32 {
        FallbackScorer::score(query, &result.text, result.effective_score())
    }

    fn update_stats(&self, docs: usize, model_docs: usize, fallback_batches: usize, timeouts: usize) {
        let mut stats = self.stats.lock();
        stats.total_calls += 1;
        stats.total_docs += docs;
        stats.model_docs += model_docs;
        stats.fallback_docs += docs - model_docs;
        stats.fallback_batches += fallback_batches;
        stats.timeouts += timeouts;
    }

    /// Get reranker statistics
    pub fn stats(&self) -> RerankerStats {
        self.stats.lock().clone()
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        *self.stats.lock() = RerankerStats::default();
    }
}

impl Default for RelevanceReranker {
    fn default() -> Self {
        Self::new(RerankerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use grounding_core::{ChunkId, SearchSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(id: &str, text: &str, score: f32) -> RetrievalResult {
        RetrievalResult::new(ChunkId::new(id), text, score, SearchSource::Hybrid)
    }

    /// Scores by passage length; fails every call listed in `fail_calls`
    struct LengthModel {
        calls: AtomicUsize,
        fail_calls: Vec<usize>,
        delay: Option<Duration>,
    }

    impl LengthModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_calls: Vec::new(),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl RelevanceModel for LengthModel {
        async fn score_batch(
            &self,
            _query: &str,
            passages: &[String],
        ) -> grounding_core::Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_calls.contains(&call) {
                return Err(grounding_core::Error::Model("boom".into()));
            }
            Ok(passages
                .iter()
                .map(|p| (p.len() as f32 / 100.0).min(1.0))
                .collect())
        }

        fn name(&self) -> &str {
            "length"
        }
    }

    #[test]
    fn test_full_phrase_scores_one() {
        let terms = tokenize("bridge fees");
        let passage = "Our Bridge   fees are low";
        let score =
            FallbackScorer::phrase_score("bridge fees", &terms, passage, &token_stream(passage));
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_partial_phrase_credit() {
        let query = "bridge fees refund policy";
        let terms = tokenize(query);
        let passage = "bridge fees are charged; refund requests follow the policy";
        let score = FallbackScorer::phrase_score(query, &terms, passage, &token_stream(passage));
        // "bridge fees" is contiguous, the other two pairs are not
        assert!((score - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_ignores_short_terms() {
        let terms = tokenize("go bridge");
        let tokens = token_stream("the bridge");
        assert_eq!(FallbackScorer::overlap_score(&terms, &tokens), 1.0);
    }

    #[test]
    fn test_proximity_cases() {
        let terms = tokenize("staking rewards");
        assert_eq!(FallbackScorer::proximity_score(&terms, &token_stream("nothing here")), 0.0);
        assert_eq!(FallbackScorer::proximity_score(&terms, &token_stream("staking only")), 1.0);

        let close = FallbackScorer::proximity_score(&terms, &token_stream("staking rewards"));
        let far = FallbackScorer::proximity_score(
            &terms,
            &token_stream("staking is covered elsewhere in many long pages before rewards"),
        );
        assert!(close > far);
    }

    #[test]
    fn test_distinct_strengths_get_distinct_scores() {
        let query = "validator staking rewards";
        let strong = FallbackScorer::score(query, "Validator staking rewards are paid daily", 0.5);
        let medium = FallbackScorer::score(
            query,
            "Rewards depend on uptime. Each validator must keep staking",
            0.5,
        );
        let weak = FallbackScorer::score(query, "Staking is optional", 0.5);
        let none = FallbackScorer::score(query, "Unrelated weather report", 0.5);

        assert!(strong > medium, "{} vs {}", strong, medium);
        assert!(medium > weak, "{} vs {}", medium, weak);
        assert!(weak > none, "{} vs {}", weak, none);
        assert!(strong <= 1.0 && none >= 0.0);
    }

    #[test]
    fn test_prior_breaks_ties() {
        let low = FallbackScorer::score("bridge", "bridge", 0.1);
        let high = FallbackScorer::score("bridge", "bridge", 0.9);
        assert!(high > low);
        assert!(FallbackScorer::score("bridge", "bridge", f32::NAN) <= 1.0);
    }

    #[test]
    fn test_empty_query_uses_prior_only() {
        let score = FallbackScorer::score("", "anything", 0.5);
        assert!((score - 0.05).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rerank_without_model() {
        let reranker = RelevanceReranker::default();
        let reranked = reranker
            .rerank(
                "bridge fees",
                vec![
                    result("weather", "Sunny weather tomorrow", 0.9),
                    result("fees", "Bridge fees are 0.1%", 0.2),
                ],
            )
            .await;

        assert_eq!(reranked.results[0].id.as_str(), "fees");
        assert!(reranked.results.iter().all(|r| r.cross_encoder_score.is_some()));
        assert_eq!(reranked.fallback_batches, 0);

        let stats = reranker.stats();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.fallback_docs, 2);
        assert_eq!(stats.model_docs, 0);

        reranker.reset_stats();
        assert_eq!(reranker.stats(), RerankerStats::default());
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_alone() {
        let model = LengthModel {
            fail_calls: vec![1],
            ..LengthModel::new()
        };
        let reranker = RelevanceReranker::new(RerankerConfig {
            batch_size: 2,
            ..RerankerConfig::default()
        })
        .with_model(Arc::new(model));

        let results = (0..5)
            .map(|i| result(&format!("r{}", i), &"x".repeat(10 * (i + 1)), 0.5))
            .collect();
        let reranked = reranker.rerank("query", results).await;

        assert_eq!(reranked.results.len(), 5);
        assert_eq!(reranked.fallback_batches, 1);

        let stats = reranker.stats();
        assert_eq!(stats.model_docs, 3);
        assert_eq!(stats.fallback_docs, 2);
        assert_eq!(stats.fallback_batches, 1);
    }

    #[tokio::test]
    async fn test_timed_out_batch_falls_back() {
        let model = LengthModel {
            delay: Some(Duration::from_millis(200)),
            ..LengthModel::new()
        };
        let reranker = RelevanceReranker::new(RerankerConfig {
            model_timeout: Duration::from_millis(10),
            ..RerankerConfig::default()
        })
        .with_model(Arc::new(model));

        let reranked = reranker
            .rerank("bridge", vec![result("a", "bridge", 0.4)])
            .await;

        assert_eq!(reranked.fallback_batches, 1);
        assert_eq!(reranker.stats().timeouts, 1);
        assert!(reranked.results[0].cross_encoder_score.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_model_scores_used() {
        let reranker = RelevanceReranker::default().with_model(Arc::new(LengthModel::new()));
        let reranked = reranker
            .rerank(
                "q",
                vec![result("short", "abc", 0.9), result("long", &"y".repeat(80), 0.1)],
            )
            .await;

        assert_eq!(reranked.results[0].id.as_str(), "long");
        assert!((reranked.results[0].cross_encoder_score.unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(reranker.stats().model_docs, 2);
    }
}
