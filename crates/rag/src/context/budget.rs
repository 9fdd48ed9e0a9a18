//! Token budget allocation and greedy chunk selection

use grounding_core::RetrievalResult;

use super::ContextConfig;
use crate::tokens::{estimate_tokens, truncate_to_tokens};

/// Tokens left for the knowledge section
///
/// The reservations for system prompt and query come off the total, then the
/// history actually used (capped at its allowance); the remainder is capped
/// at the knowledge allowance.
pub fn knowledge_allowance(config: &ContextConfig, history_tokens: usize) -> usize {
    let history = history_tokens.min(config.history_tokens);
    config
        .total_tokens
        .saturating_sub(config.system_prompt_tokens)
        .saturating_sub(config.query_tokens)
        .saturating_sub(history)
        .min(config.knowledge_tokens)
}

/// A chunk admitted into the knowledge section
#[derive(Debug, Clone)]
pub struct SelectedChunk {
    pub result: RetrievalResult,
    /// Text that will be rendered (possibly truncated)
    pub text: String,
    /// Tokens charged: body plus its rendered frame
    pub tokens: usize,
    pub truncated: bool,
}

/// Greedily admit chunks in the given order until the allowance is spent
///
/// `frame_tokens(result, position)` is what rendering adds around the body
/// at that position (header, separator, meta card, citation). Each chunk is
/// charged its body plus its frame, so the rendered section stays within
/// the allowance. A body that does not fit is truncated at a sentence or
/// word boundary; it is kept only if the kept part still reaches
/// `min_chunk_tokens`. Skipped chunks do not stop the scan, a later smaller
/// one may still fit.
pub fn select_within_budget<F>(
    results: Vec<RetrievalResult>,
    allowance: usize,
    min_chunk_tokens: usize,
    max_chunks: usize,
    frame_tokens: F,
) -> Vec<SelectedChunk>
where
    F: Fn(&RetrievalResult, usize) -> usize,
{
    let mut selected = Vec::new();
    let mut used = 0usize;

    for result in results {
        if selected.len() >= max_chunks {
            break;
        }
        let remaining = allowance.saturating_sub(used);
        if remaining == 0 {
            break;
        }

        let overhead = frame_tokens(&result, selected.len());
        let Some(body_budget) = remaining.checked_sub(overhead).filter(|b| *b > 0) else {
            tracing::trace!(id = %result.id, overhead, remaining, "Frame alone exceeds budget");
            continue;
        };

        let tokens = estimate_tokens(&result.text);
        if tokens <= body_budget {
            used += overhead + tokens;
            selected.push(SelectedChunk {
                text: result.text.clone(),
                tokens: overhead + tokens,
                truncated: false,
                result,
            });
            continue;
        }

        match truncate_to_tokens(&result.text, body_budget) {
            Some(cut) if cut.tokens >= min_chunk_tokens && cut.tokens <= body_budget => {
                tracing::debug!(
                    id = %result.id,
                    original = tokens,
                    kept = cut.tokens,
                    overhead,
                    "Truncated chunk to fit budget"
                );
                used += overhead + cut.tokens;
                selected.push(SelectedChunk {
                    text: cut.text,
                    tokens: overhead + cut.tokens,
                    truncated: true,
                    result,
                });
            },
            _ => {
                tracing::trace!(id = %result.id, tokens, body_budget, "Chunk skipped");
            },
        }
    }

    selected
}
