//! Cross-source deduplication
//!
//! With a [`ClusteringService`] the candidates are grouped by semantic
//! similarity and one representative is kept per cluster. Without one, exact
//! and near duplicates are removed by hashing normalized text.

use std::collections::{HashMap, HashSet};

use grounding_config::constants::context as defaults;
use grounding_core::{ChunkId, ClusteringService, IntentKind, RetrievalResult};

use super::source::compare_priority;
use crate::tokenizer::tokenize;
use crate::tokens::estimate_tokens;

/// Keep one representative per semantic cluster
///
/// Ids the service does not return, or returns for unknown items, are
/// ignored; any candidate left out of every cluster passes through.
pub async fn cluster_dedup(
    clustering: &dyn ClusteringService,
    results: Vec<RetrievalResult>,
    threshold: f32,
    query: &str,
    intents: &[IntentKind],
) -> grounding_core::Result<Vec<RetrievalResult>> {
    if results.len() < 2 {
        return Ok(results);
    }

    let clusters = clustering.cluster(&results, threshold).await?;

    let index: HashMap<&ChunkId, usize> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.id, i))
        .collect();
    let mut assigned: HashSet<usize> = HashSet::new();
    let mut keep: Vec<usize> = Vec::new();

    for cluster in &clusters {
        let members: Vec<usize> = cluster
            .iter()
            .filter_map(|id| index.get(id).copied())
            .filter(|i| assigned.insert(*i))
            .collect();
        if members.is_empty() {
            continue;
        }

        let candidates: Vec<&RetrievalResult> = members.iter().map(|&i| &results[i]).collect();
        let scores = representative_scores(&candidates, query, intents);
        let best = members
            .iter()
            .zip(&scores)
            .max_by(|x, y| {
                x.1.total_cmp(y.1)
                    .then_with(|| compare_priority(&results[*y.0], &results[*x.0]))
            })
            .map(|(&i, _)| i);
        if let Some(best) = best {
            keep.push(best);
        }
    }

    let clustered = assigned.len();
    let kept: HashSet<usize> = keep.into_iter().collect();
    let before = results.len();

    let mut deduped: Vec<RetrievalResult> = results
        .into_iter()
        .enumerate()
        .filter(|(i, _)| kept.contains(i) || !assigned.contains(i))
        .map(|(_, r)| r)
        .collect();
    deduped.sort_by(compare_priority);

    tracing::debug!(
        clusters = clusters.len(),
        clustered,
        before,
        after = deduped.len(),
        "Cluster dedup"
    );
    Ok(deduped)
}

/// Weighted representative score for each cluster member
///
/// Retrieval score 35%, completeness 25%, metadata richness 15%, query
/// keyword overlap 10%, meta card 15% (plus a boost when the card answers a
/// detected intent). Length and richness are relative to the cluster.
pub fn representative_scores(
    members: &[&RetrievalResult],
    query: &str,
    intents: &[IntentKind],
) -> Vec<f32> {
    let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
    let max_tokens = members
        .iter()
        .map(|r| estimate_tokens(&r.text))
        .max()
        .unwrap_or(0)
        .max(1);
    let max_richness = members
        .iter()
        .map(|r| r.metadata.richness())
        .max()
        .unwrap_or(0)
        .max(1);

    members
        .iter()
        .map(|r| {
            let retrieval = r.effective_score().clamp(0.0, 1.0);
            let completeness = estimate_tokens(&r.text) as f32 / max_tokens as f32;
            let richness = r.metadata.richness() as f32 / max_richness as f32;

            let overlap = if query_terms.is_empty() {
                0.0
            } else {
                let terms: HashSet<String> = tokenize(&r.text).into_iter().collect();
                query_terms.intersection(&terms).count() as f32 / query_terms.len() as f32
            };

            let card = match r.meta_card.as_ref().filter(|c| !c.is_empty()) {
                Some(card) => {
                    let boost = if intents.iter().any(|i| card.matches_intent(*i)) {
                        defaults::REP_INTENT_BOOST
                    } else {
                        0.0
                    };
                    defaults::REP_META_CARD_WEIGHT + boost
                },
                None => 0.0,
            };

            defaults::REP_SCORE_WEIGHT * retrieval
                + defaults::REP_LENGTH_WEIGHT * completeness
                + defaults::REP_METADATA_WEIGHT * richness
                + defaults::REP_KEYWORD_WEIGHT * overlap
                + card
        })
        .collect()
}

/// Drop exact and near duplicates of already kept, better candidates
pub fn hash_dedup(mut results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    results.sort_by(compare_priority);

    let mut exact: HashSet<blake3::Hash> = HashSet::new();
    let mut prefixes: HashSet<String> = HashSet::new();
    let before = results.len();

    let deduped: Vec<RetrievalResult> = results
        .into_iter()
        .filter(|r| {
            let normalized = normalize_text(&r.text);
            if normalized.is_empty() {
                return true;
            }
            let fresh_hash = exact.insert(blake3::hash(normalized.as_bytes()));
            let prefix: String = normalized
                .chars()
                .take(defaults::NEAR_DUP_PREFIX_CHARS)
                .collect();
            let fresh_prefix = prefixes.insert(prefix);
            fresh_hash && fresh_prefix
        })
        .collect();

    tracing::debug!(before, after = deduped.len(), "Hash dedup");
    deduped
}

/// Lowercase and collapse whitespace
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
