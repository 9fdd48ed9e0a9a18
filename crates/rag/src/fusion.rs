//! Dense + keyword score fusion
//!
//! Weights are chosen per query from its intents and exact signals, then the
//! two ranked lists are merged on a shared dedup key with an additive
//! weighted sum.

use std::collections::HashMap;

use grounding_config::constants::fusion;
use grounding_config::RetrievalSettings;
use grounding_core::{IntentKind, QueryAnalysis, RetrievalResult, SearchSource};
use serde::{Deserialize, Serialize};

/// Fusion configuration
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Base dense weight; the keyword weight is its complement
    pub dense_weight: f32,
    /// Floor for the dense weight after intent adjustments
    pub min_dense_weight: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            dense_weight: fusion::DENSE_WEIGHT,
            min_dense_weight: fusion::MIN_DENSE_WEIGHT,
        }
    }
}

impl From<&RetrievalSettings> for FusionConfig {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            dense_weight: settings.dense_weight,
            min_dense_weight: settings.min_dense_weight,
        }
    }
}

/// Weights used for one query; always sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub dense: f32,
    pub keyword: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            dense: fusion::DENSE_WEIGHT,
            keyword: fusion::KEYWORD_WEIGHT,
        }
    }
}

/// Choose fusion weights for an analyzed query
///
/// The strongest intent sets the keyword weight (contract address, then
/// ticker, then official channel, then technical specs). Exact signals add a
/// capped boost. The dense weight is floored at `min_dense_weight` and the
/// keyword weight recomputed as its complement.
pub fn calculate_dynamic_weights(analysis: &QueryAnalysis, config: &FusionConfig) -> FusionWeights {
    let mut keyword = if analysis.has_intent(IntentKind::ContractAddress) {
        fusion::CONTRACT_ADDRESS_KEYWORD_WEIGHT
    } else if analysis.has_intent(IntentKind::TickerSymbol) {
        fusion::TICKER_KEYWORD_WEIGHT
    } else if analysis.has_intent(IntentKind::OfficialChannel) {
        fusion::OFFICIAL_CHANNEL_KEYWORD_WEIGHT
    } else if analysis.has_intent(IntentKind::TechnicalSpecs) {
        fusion::TECHNICAL_SPECS_KEYWORD_WEIGHT
    } else {
        1.0 - config.dense_weight
    };

    let signals = analysis.exact_signals.len();
    if signals > 0 {
        keyword += (fusion::SIGNAL_BOOST_PER_SIGNAL * signals as f32).min(fusion::SIGNAL_BOOST_CAP);
    }

    let floor = config.min_dense_weight.clamp(0.0, 1.0);
    let dense = (1.0 - keyword).clamp(floor, 1.0);

    FusionWeights {
        dense,
        keyword: 1.0 - dense,
    }
}

/// Merge dense and keyword hits
///
/// Keyword scores are divided by the best keyword score so both inputs live
/// in [0, 1]. Hits are keyed by [`RetrievalResult::fusion_key`]; within one
/// list only the best hit per key counts. A key found in both lists gets the
/// sum of both weighted contributions and is marked [`SearchSource::Hybrid`].
/// The output is sorted by `final_score` descending, ties by id.
pub fn fuse(
    dense: Vec<RetrievalResult>,
    keyword: Vec<RetrievalResult>,
    weights: FusionWeights,
) -> Vec<RetrievalResult> {
    let max_keyword = keyword
        .iter()
        .map(|r| r.bm25_score.unwrap_or(r.score))
        .filter(|s| s.is_finite())
        .fold(0.0f32, f32::max);

    let mut merged: Vec<RetrievalResult> = Vec::with_capacity(dense.len() + keyword.len());
    let mut by_key: HashMap<String, usize> = HashMap::new();
    // (dense contribution, keyword contribution) per merged slot
    let mut parts: Vec<(Option<f32>, Option<f32>)> = Vec::new();

    for result in dense {
        let similarity = finite(result.dense_score.unwrap_or(result.score));
        let contribution = weights.dense * similarity;
        let key = result.fusion_key();

        match by_key.get(&key).copied() {
            Some(slot) => {
                let best = parts[slot].0.get_or_insert(contribution);
                *best = best.max(contribution);
            },
            None => {
                by_key.insert(key, merged.len());
                let mut result = result;
                result.dense_score = Some(similarity);
                merged.push(result);
                parts.push((Some(contribution), None));
            },
        }
    }

    for result in keyword {
        let raw = finite(result.bm25_score.unwrap_or(result.score));
        let normalized = if max_keyword > 0.0 {
            (raw / max_keyword).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let contribution = weights.keyword * normalized;
        let key = result.fusion_key();

        match by_key.get(&key).copied() {
            Some(slot) => {
                let existing = &mut merged[slot];
                if existing.bm25_score.map_or(true, |s| raw > s) {
                    existing.bm25_score = Some(raw);
                }
                let entry = &mut parts[slot].1;
                *entry = Some(entry.map_or(contribution, |c| c.max(contribution)));
            },
            None => {
                by_key.insert(key, merged.len());
                let mut result = result;
                result.bm25_score = Some(raw);
                merged.push(result);
                parts.push((None, Some(contribution)));
            },
        }
    }

    for (result, (dense_part, keyword_part)) in merged.iter_mut().zip(parts) {
        let fused = dense_part.unwrap_or(0.0) + keyword_part.unwrap_or(0.0);
        result.source = match (dense_part, keyword_part) {
            (Some(_), Some(_)) => SearchSource::Hybrid,
            (Some(_), None) => SearchSource::Dense,
            _ => SearchSource::Keyword,
        };
        result.score = fused;
        result.final_score = Some(fused);
    }

    merged.sort_by(|x, y| {
        y.effective_score()
            .total_cmp(&x.effective_score())
            .then_with(|| x.id.cmp(&y.id))
    });
    merged
}

fn finite(score: f32) -> f32 {
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounding_core::{ChunkId, ChunkMetadata, ExactSignal, Intent, SignalKind};
    use proptest::prelude::*;

    fn analysis(intents: &[IntentKind], signals: usize) -> QueryAnalysis {
        QueryAnalysis {
            intents: intents
                .iter()
                .map(|&kind| Intent {
                    kind,
                    confidence: 0.9,
                })
                .collect(),
            exact_signals: (0..signals)
                .map(|i| ExactSignal {
                    kind: SignalKind::Ticker,
                    value: format!("$T{}", i),
                    start: i * 4,
                    end: i * 4 + 3,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn dense_hit(id: &str, score: f32) -> RetrievalResult {
        let mut r = RetrievalResult::new(ChunkId::new(id), id, score, SearchSource::Dense);
        r.dense_score = Some(score);
        r
    }

    fn keyword_hit(id: &str, score: f32) -> RetrievalResult {
        let mut r = RetrievalResult::new(ChunkId::new(id), id, score, SearchSource::Keyword);
        r.bm25_score = Some(score);
        r
    }

    #[test]
    fn test_base_weights() {
        let weights = calculate_dynamic_weights(&analysis(&[], 0), &FusionConfig::default());
        assert!((weights.dense - 0.7).abs() < 1e-6);
        assert!((weights.keyword - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_intent_precedence() {
        let config = FusionConfig::default();

        let w = calculate_dynamic_weights(
            &analysis(&[IntentKind::TechnicalSpecs, IntentKind::ContractAddress], 0),
            &config,
        );
        assert!((w.keyword - 0.8).abs() < 1e-6);

        let w = calculate_dynamic_weights(&analysis(&[IntentKind::TickerSymbol], 0), &config);
        assert!((w.keyword - 0.75).abs() < 1e-6);

        let w = calculate_dynamic_weights(&analysis(&[IntentKind::OfficialChannel], 0), &config);
        assert!((w.keyword - 0.65).abs() < 1e-6);

        let w = calculate_dynamic_weights(&analysis(&[IntentKind::TechnicalSpecs], 0), &config);
        assert!((w.keyword - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_signal_boost_hits_dense_floor() {
        // 0.75 + 0.2 would leave dense at 0.05, floored to 0.2
        let w = calculate_dynamic_weights(
            &analysis(&[IntentKind::TickerSymbol], 3),
            &FusionConfig::default(),
        );
        assert!((w.dense - 0.2).abs() < 1e-6);
        assert!((w.keyword - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_signal_boost_without_intent() {
        let w = calculate_dynamic_weights(&analysis(&[], 1), &FusionConfig::default());
        assert!((w.keyword - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_fuse_hybrid_sum() {
        let weights = FusionWeights {
            dense: 0.5,
            keyword: 0.5,
        };
        let fused = fuse(
            vec![dense_hit("a", 0.8), dense_hit("b", 0.6)],
            vec![keyword_hit("b", 4.0), keyword_hit("c", 2.0)],
            weights,
        );

        assert_eq!(fused.len(), 3);
        let b = fused.iter().find(|r| r.id.as_str() == "b").unwrap();
        assert_eq!(b.source, SearchSource::Hybrid);
        assert!((b.effective_score() - (0.3 + 0.5)).abs() < 1e-6);
        assert_eq!(b.bm25_score, Some(4.0));

        let c = fused.iter().find(|r| r.id.as_str() == "c").unwrap();
        assert_eq!(c.source, SearchSource::Keyword);
        assert!((c.effective_score() - 0.25).abs() < 1e-6);

        assert_eq!(fused[0].id.as_str(), "b");
    }

    #[test]
    fn test_fuse_dedups_by_source_id() {
        let meta = ChunkMetadata::new().with_source("doc-1");
        let fused = fuse(
            vec![dense_hit("doc-1#p0", 0.9).with_metadata(meta.clone())],
            vec![keyword_hit("doc-1#p1", 3.0).with_metadata(meta)],
            FusionWeights::default(),
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].source, SearchSource::Hybrid);
        assert_eq!(fused[0].id.as_str(), "doc-1#p0");
    }

    #[test]
    fn test_fuse_empty_inputs() {
        assert!(fuse(Vec::new(), Vec::new(), FusionWeights::default()).is_empty());
    }

    #[test]
    fn test_keyword_scores_normalized() {
        let fused = fuse(
            Vec::new(),
            vec![keyword_hit("a", 12.0), keyword_hit("b", 6.0)],
            FusionWeights {
                dense: 0.0,
                keyword: 1.0,
            },
        );
        assert!((fused[0].effective_score() - 1.0).abs() < 1e-6);
        assert!((fused[1].effective_score() - 0.5).abs() < 1e-6);
    }

    fn intent_strategy() -> impl Strategy<Value = Vec<IntentKind>> {
        proptest::collection::vec(
            prop_oneof![
                Just(IntentKind::ContractAddress),
                Just(IntentKind::TickerSymbol),
                Just(IntentKind::OfficialChannel),
                Just(IntentKind::TechnicalSpecs),
            ],
            0..4,
        )
    }

    proptest! {
        #[test]
        fn prop_weights_sum_to_one(
            intents in intent_strategy(),
            signals in 0usize..6,
            min_dense in 0.0f32..=0.3,
        ) {
            let config = FusionConfig { min_dense_weight: min_dense, ..FusionConfig::default() };
            let w = calculate_dynamic_weights(&analysis(&intents, signals), &config);
            prop_assert!((w.dense + w.keyword - 1.0).abs() < 1e-6);
            prop_assert!(w.dense >= min_dense - 1e-6);
        }

        #[test]
        fn prop_contract_intent_keeps_keyword_high(
            signals in 0usize..6,
            min_dense in 0.0f32..=0.3,
        ) {
            let config = FusionConfig { min_dense_weight: min_dense, ..FusionConfig::default() };
            let w = calculate_dynamic_weights(
                &analysis(&[IntentKind::ContractAddress], signals),
                &config,
            );
            prop_assert!(w.keyword >= 0.7 - 1e-6);
        }
    }
}
