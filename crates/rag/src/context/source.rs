//! Source identity and per-source caps

use std::cmp::Ordering;
use std::collections::HashMap;

use grounding_config::constants::context::COMPLETE_ENOUGH_TOKENS;
use grounding_core::RetrievalResult;

use crate::tokens::estimate_tokens;

/// Hex characters kept from the url/path hash
const URL_HASH_LEN: usize = 16;

/// Resolve the dedup identity of a result
///
/// `source_id`, then `url:<hash of url or path>`, then
/// `collection_id:doc_key`, then the chunk id, then `unknown::<domain>`.
pub fn resolve_source_id(result: &RetrievalResult) -> String {
    let meta = &result.metadata;
    let present = |v: &Option<String>| {
        v.as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    if let Some(source_id) = present(&meta.source_id) {
        return source_id;
    }
    if let Some(location) = present(&meta.url).or_else(|| present(&meta.path)) {
        let hash = blake3::hash(location.as_bytes()).to_hex();
        return format!("url:{}", &hash[..URL_HASH_LEN]);
    }
    if let (Some(collection), Some(doc_key)) = (present(&meta.collection_id), present(&meta.doc_key))
    {
        return format!("{}:{}", collection, doc_key);
    }
    if !result.id.as_str().is_empty() {
        return result.id.as_str().to_string();
    }
    format!("unknown::{}", meta.domain.as_deref().unwrap_or("default"))
}

/// Selection order within a source
///
/// Higher effective score, then higher MMR score, then (when both are
/// complete enough) the shorter text, otherwise the longer one, then richer
/// metadata. `Less` means `a` is preferred.
pub fn compare_priority(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.effective_score()
        .total_cmp(&a.effective_score())
        .then_with(|| {
            let am = a.mmr_score.unwrap_or(f32::NEG_INFINITY);
            let bm = b.mmr_score.unwrap_or(f32::NEG_INFINITY);
            bm.total_cmp(&am)
        })
        .then_with(|| {
            let at = estimate_tokens(&a.text);
            let bt = estimate_tokens(&b.text);
            if at > COMPLETE_ENOUGH_TOKENS && bt > COMPLETE_ENOUGH_TOKENS {
                at.cmp(&bt)
            } else {
                bt.cmp(&at)
            }
        })
        .then_with(|| b.metadata.richness().cmp(&a.metadata.richness()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Keep at most `cap` results per resolved source, best first
pub fn cap_per_source(mut results: Vec<RetrievalResult>, cap: usize) -> Vec<RetrievalResult> {
    results.sort_by(compare_priority);

    let mut counts: HashMap<String, usize> = HashMap::new();
    results
        .into_iter()
        .filter(|r| {
            let count = counts.entry(resolve_source_id(r)).or_insert(0);
            *count += 1;
            *count <= cap
        })
        .collect()
}
