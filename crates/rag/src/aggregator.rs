//! Parent/child aggregation
//!
//! Fragment-level hits are grouped by their resolved parent, each group is
//! scored, and the best groups are rebuilt into larger context blocks.

use std::collections::{BTreeMap, HashSet};

use grounding_config::constants::aggregation;
use grounding_config::{AggregationSettings, AggregationStrategy};
use grounding_core::{BuildMode, ChildRef, IntentKind, ParentBlock, RetrievalResult};

use crate::telemetry::{record_degraded, DegradedStage};
use crate::tokens::{estimate_tokens, sentences, truncate_to_tokens};
use crate::RagError;

/// Segments a source path needs before it is treated as a knowledge-base path
const KB_PATH_MIN_SEGMENTS: usize = 3;

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub strategy: AggregationStrategy,
    pub min_parent_tokens: usize,
    pub max_parent_tokens: usize,
    /// Groups rebuilt into blocks
    pub max_parents: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::WeightedMax,
            min_parent_tokens: aggregation::MIN_PARENT_TOKENS,
            max_parent_tokens: aggregation::MAX_PARENT_TOKENS,
            max_parents: aggregation::MAX_PARENTS,
        }
    }
}

impl From<&AggregationSettings> for AggregatorConfig {
    fn from(settings: &AggregationSettings) -> Self {
        Self {
            strategy: settings.strategy,
            min_parent_tokens: settings.min_parent_tokens,
            max_parent_tokens: settings.max_parent_tokens,
            max_parents: settings.max_parents,
        }
    }
}

/// Children sharing one parent, with their scores
#[derive(Debug, Clone)]
pub struct ParentGroup {
    pub parent_id: String,
    pub children: Vec<RetrievalResult>,
    /// Per-child score including the meta-card bonus, same order as `children`
    pub child_scores: Vec<f32>,
    /// Strategy aggregate before the multi-hit bonus
    pub base_score: f32,
    pub multi_hit_bonus: f32,
    /// `base_score + multi_hit_bonus`
    pub aggregated_score: f32,
}

/// Blocks built from the best groups
#[derive(Debug, Clone, Default)]
pub struct AggregationOutcome {
    pub blocks: Vec<ParentBlock>,
    /// Groups that fell back to their largest child
    pub fallbacks: usize,
}

/// Parent/child aggregator
#[derive(Debug, Clone, Default)]
pub struct ParentAggregator {
    config: AggregatorConfig,
}

impl ParentAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Resolve the parent identity of a hit
    ///
    /// 1. explicit `parent_chunk`
    /// 2. first two segments of a knowledge-base style source path
    /// 3. `source_id::section`
    /// 4. the chunk's own id, a singleton group; a numeric `#pN` fragment
    ///    suffix (see [`grounding_core::ChunkId::part`]) is dropped so
    ///    sibling fragments of one document still group together
    pub fn get_parent_id(result: &RetrievalResult) -> String {
        let meta = &result.metadata;

        if let Some(parent) = &meta.parent_chunk {
            return parent.as_str().to_string();
        }

        let source = meta.source_id.as_deref().or(meta.path.as_deref());
        if let Some(prefix) = source.and_then(kb_path_prefix) {
            return prefix;
        }

        if let (Some(source_id), Some(section)) = (&meta.source_id, &meta.section) {
            return format!("{}::{}", source_id, section);
        }

        result.id.base().to_string()
    }

    /// Group and score hits, best group first
    pub fn score_parent_groups(
        &self,
        results: &[RetrievalResult],
        intents: &[IntentKind],
    ) -> Vec<ParentGroup> {
        let mut grouped: BTreeMap<String, Vec<RetrievalResult>> = BTreeMap::new();
        for result in results {
            grouped
                .entry(Self::get_parent_id(result))
                .or_default()
                .push(result.clone());
        }

        let mut groups: Vec<ParentGroup> = grouped
            .into_iter()
            .map(|(parent_id, children)| self.score_group(parent_id, children, intents))
            .collect();

        groups.sort_by(|x, y| {
            y.aggregated_score
                .total_cmp(&x.aggregated_score)
                .then_with(|| x.parent_id.cmp(&y.parent_id))
        });

        tracing::debug!(hits = results.len(), groups = groups.len(), "Scored parent groups");
        groups
    }

    fn score_group(
        &self,
        parent_id: String,
        children: Vec<RetrievalResult>,
        intents: &[IntentKind],
    ) -> ParentGroup {
        let child_scores: Vec<f32> = children
            .iter()
            .map(|c| c.effective_score() + meta_card_bonus(c, intents))
            .collect();

        let n = child_scores.len().max(1) as f32;
        let max = child_scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let max = if max.is_finite() { max } else { 0.0 };
        let mean = child_scores.iter().sum::<f32>() / n;

        let base_score = match self.config.strategy {
            AggregationStrategy::WeightedMax => {
                aggregation::MAX_WEIGHT * max + aggregation::MEAN_WEIGHT * mean
            },
            AggregationStrategy::Max => max,
            AggregationStrategy::Mean => mean,
        };

        let extra_children = children.len().saturating_sub(1) as f32;
        let multi_hit_bonus = (extra_children * aggregation::MULTI_HIT_BONUS_PER_CHILD)
            .min(aggregation::MULTI_HIT_BONUS_CAP);

        ParentGroup {
            parent_id,
            children,
            child_scores,
            base_score,
            multi_hit_bonus,
            aggregated_score: base_score + multi_hit_bonus,
        }
    }

    /// Rebuild the top `max_parents` groups into blocks
    pub fn build_parent_blocks(&self, groups: &[ParentGroup]) -> AggregationOutcome {
        let mut outcome = AggregationOutcome::default();

        for group in groups.iter().take(self.config.max_parents) {
            match self.build_block(group) {
                Ok(block) => outcome.blocks.push(block),
                Err(e) => {
                    tracing::warn!(
                        parent_id = %group.parent_id,
                        error = %e,
                        "Parent block build failed, using largest child"
                    );
                    record_degraded(DegradedStage::ParentBuild);
                    if let Some(block) = largest_child_block(group) {
                        outcome.blocks.push(block);
                        outcome.fallbacks += 1;
                    }
                },
            }
        }

        outcome
    }

    /// Score and build in one step
    pub fn aggregate_to_parents(
        &self,
        results: &[RetrievalResult],
        intents: &[IntentKind],
    ) -> AggregationOutcome {
        let groups = self.score_parent_groups(results, intents);
        self.build_parent_blocks(&groups)
    }

    fn build_block(&self, group: &ParentGroup) -> Result<ParentBlock, RagError> {
        if group.children.is_empty() {
            return Err(RagError::Index(format!("group {} has no children", group.parent_id)));
        }

        let ordered = ordered_children(group);
        let contiguous = self.merge_contiguous(&ordered);
        let contiguous_tokens = estimate_tokens(&contiguous);

        let (text, build_mode) = if (self.config.min_parent_tokens..=self.config.max_parent_tokens)
            .contains(&contiguous_tokens)
        {
            (contiguous, BuildMode::Contiguous)
        } else {
            (self.concatenate_best(group)?, BuildMode::Concatenated)
        };

        if text.trim().is_empty() {
            return Err(RagError::Index(format!("group {} produced empty text", group.parent_id)));
        }

        Ok(assemble_block(group, text, build_mode))
    }

    /// Merge ordered children, dropping sentences repeated across the seam
    fn merge_contiguous(&self, ordered: &[(&RetrievalResult, f32)]) -> String {
        let mut merged = String::new();

        for (child, _) in ordered {
            if merged.is_empty() {
                merged.push_str(child.text.trim());
            } else {
                let addition = strip_overlap(&merged, &child.text);
                if !addition.is_empty() {
                    merged.push('\n');
                    merged.push_str(addition);
                }
            }

            if estimate_tokens(&merged) > self.config.max_parent_tokens {
                break;
            }
        }

        merged
    }

    /// Highest-scoring children joined with a delimiter, within budget
    fn concatenate_best(&self, group: &ParentGroup) -> Result<String, RagError> {
        let mut by_score: Vec<(&RetrievalResult, f32)> = group
            .children
            .iter()
            .zip(group.child_scores.iter().copied())
            .collect();
        by_score.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.id.cmp(&y.0.id)));

        let budget = self.config.max_parent_tokens;
        let mut parts: Vec<&str> = Vec::new();
        let mut joined = String::new();

        for (child, _) in &by_score {
            let text = child.text.trim();
            if text.is_empty() {
                continue;
            }
            let candidate = if joined.is_empty() {
                text.to_string()
            } else {
                format!("{}{}{}", joined, aggregation::CONCAT_DELIMITER, text)
            };
            if estimate_tokens(&candidate) <= budget {
                joined = candidate;
                parts.push(text);
            }
        }

        if !parts.is_empty() {
            return Ok(joined);
        }

        // Even the best child is over budget on its own
        let best = by_score
            .first()
            .map(|(child, _)| child.text.as_str())
            .unwrap_or_default();
        truncate_to_tokens(best, budget)
            .map(|t| t.text)
            .ok_or_else(|| RagError::Index(format!("group {} does not fit", group.parent_id)))
    }
}

/// `a/b/...` with at least three segments maps to `a/b`
fn kb_path_prefix(source: &str) -> Option<String> {
    if !source.contains('/') {
        return None;
    }
    let segments: Vec<&str> = source.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < KB_PATH_MIN_SEGMENTS {
        return None;
    }
    Some(format!("{}/{}", segments[0], segments[1]))
}

/// Capped bonus for hits carrying a meta card
fn meta_card_bonus(result: &RetrievalResult, intents: &[IntentKind]) -> f32 {
    let Some(card) = result.meta_card.as_ref().filter(|c| !c.is_empty()) else {
        return 0.0;
    };
    let matching = intents.iter().filter(|i| card.matches_intent(**i)).count() as f32;
    (aggregation::META_CARD_BASE_BONUS + matching * aggregation::META_CARD_INTENT_BONUS)
        .min(aggregation::META_CARD_BONUS_CAP)
}

/// By `chunk_part` when every child has one, else by score
fn ordered_children(group: &ParentGroup) -> Vec<(&RetrievalResult, f32)> {
    let mut ordered: Vec<(&RetrievalResult, f32)> = group
        .children
        .iter()
        .zip(group.child_scores.iter().copied())
        .collect();

    if ordered.iter().all(|(c, _)| c.metadata.chunk_part.is_some()) {
        ordered.sort_by_key(|(c, _)| c.metadata.chunk_part);
    } else {
        ordered.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.id.cmp(&y.0.id)));
    }
    ordered
}

/// Remainder of `next` after dropping leading sentences that repeat the
/// trailing sentences of `previous`
fn strip_overlap<'a>(previous: &str, next: &'a str) -> &'a str {
    let prev: Vec<String> = sentences(previous)
        .into_iter()
        .map(normalize_sentence)
        .filter(|s| !s.is_empty())
        .collect();
    let next_pieces = sentences(next);

    // (normalized sentence, byte end offset in `next`)
    let mut leading: Vec<(String, usize)> = Vec::new();
    let mut offset = 0usize;
    for piece in &next_pieces {
        offset += piece.len();
        let norm = normalize_sentence(piece);
        if norm.is_empty() {
            continue;
        }
        leading.push((norm, offset));
        if leading.len() == aggregation::OVERLAP_SENTENCES {
            break;
        }
    }

    let tail_start = prev.len().saturating_sub(aggregation::OVERLAP_SENTENCES);
    let trailing = &prev[tail_start..];

    for k in (1..=leading.len().min(trailing.len())).rev() {
        let tail = &trailing[trailing.len() - k..];
        if tail.iter().zip(&leading[..k]).all(|(t, (l, _))| t == l) {
            return next[leading[k - 1].1..].trim();
        }
    }
    next.trim()
}

fn normalize_sentence(sentence: &str) -> String {
    sentence
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn assemble_block(group: &ParentGroup, text: String, build_mode: BuildMode) -> ParentBlock {
    // Best child by score supplies metadata, card and embedding
    let best_idx = group
        .child_scores
        .iter()
        .enumerate()
        .max_by(|x, y| x.1.total_cmp(y.1).then_with(|| y.0.cmp(&x.0)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let best = &group.children[best_idx];

    let mut metadata = best.metadata.clone();
    let mut seen_tags: HashSet<String> = metadata.tags.iter().cloned().collect();
    let mut sources: Vec<String> = Vec::new();
    for child in &group.children {
        for tag in &child.metadata.tags {
            if seen_tags.insert(tag.clone()) {
                metadata.tags.push(tag.clone());
            }
        }
        let source = child.fusion_key();
        if !sources.contains(&source) {
            sources.push(source);
        }
    }
    metadata
        .extra
        .insert("child_count".to_string(), group.children.len().into());

    let meta_card = best.meta_card.clone().or_else(|| {
        group
            .children
            .iter()
            .find_map(|c| c.meta_card.clone())
    });

    let children = group
        .children
        .iter()
        .zip(&group.child_scores)
        .map(|(c, &score)| ChildRef {
            id: c.id.clone(),
            score,
            position: c.metadata.chunk_part,
        })
        .collect();

    ParentBlock {
        parent_id: group.parent_id.clone(),
        tokens: estimate_tokens(&text),
        text,
        child_count: group.children.len(),
        aggregated_score: group.aggregated_score,
        metadata,
        sources,
        meta_card,
        embedding: best.embedding.clone(),
        children,
        build_mode,
    }
}

fn largest_child_block(group: &ParentGroup) -> Option<ParentBlock> {
    let largest = group.children.iter().max_by_key(|c| c.text.len())?;
    Some(assemble_block(
        group,
        largest.text.clone(),
        BuildMode::LargestChild,
    ))
}
