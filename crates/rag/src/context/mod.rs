//! Context building
//!
//! Turns reranked results into the knowledge section of a prompt:
//! per-source pre-cap, semantic (or hash) dedup, per-source post-cap,
//! token budgeting with boundary-aware truncation, and formatting.

pub mod budget;
pub mod dedup;
pub mod format;
pub mod source;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use grounding_config::constants::context as defaults;
use grounding_config::{ContextSettings, ContextStyle};
use grounding_core::{
    ClusteringService, ConversationContextProvider, ConversationSnippet, IntentKind, RetrievalResult,
};
use serde::{Deserialize, Serialize};

use crate::telemetry::{record_degraded, record_stage_latency, DegradedStage};
use crate::tokens::{estimate_tokens, truncate_to_tokens};

pub use budget::SelectedChunk;

/// Context builder configuration
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub total_tokens: usize,
    pub system_prompt_tokens: usize,
    pub query_tokens: usize,
    pub history_tokens: usize,
    pub knowledge_tokens: usize,
    pub min_chunk_tokens: usize,
    pub max_chunks: usize,
    pub pre_cap_per_source: usize,
    pub post_cap_per_source: usize,
    pub cluster_threshold: f32,
    pub style: ContextStyle,
    pub include_citations: bool,
    pub system_prompt: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            total_tokens: defaults::TOTAL_TOKENS,
            system_prompt_tokens: defaults::SYSTEM_PROMPT_TOKENS,
            query_tokens: defaults::QUERY_TOKENS,
            history_tokens: defaults::HISTORY_TOKENS,
            knowledge_tokens: defaults::KNOWLEDGE_TOKENS,
            min_chunk_tokens: defaults::MIN_CHUNK_TOKENS,
            max_chunks: defaults::MAX_CHUNKS,
            pre_cap_per_source: defaults::PRE_CAP_PER_SOURCE,
            post_cap_per_source: defaults::POST_CAP_PER_SOURCE,
            cluster_threshold: defaults::CLUSTER_THRESHOLD,
            style: ContextStyle::default(),
            include_citations: true,
            system_prompt: String::new(),
        }
    }
}

impl From<&ContextSettings> for ContextConfig {
    fn from(settings: &ContextSettings) -> Self {
        Self {
            total_tokens: settings.total_tokens,
            system_prompt_tokens: settings.system_prompt_tokens,
            query_tokens: settings.query_tokens,
            history_tokens: settings.history_tokens,
            knowledge_tokens: settings.knowledge_tokens,
            min_chunk_tokens: settings.min_chunk_tokens,
            max_chunks: settings.max_chunks,
            pre_cap_per_source: settings.pre_cap_per_source,
            post_cap_per_source: settings.post_cap_per_source,
            cluster_threshold: settings.cluster_threshold,
            style: settings.style,
            include_citations: settings.include_citations,
            system_prompt: settings.system_prompt.clone(),
        }
    }
}

/// How duplicates were removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    Clustering,
    Hash,
}

/// Prompt pieces in the order they are sent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptSections {
    pub system: String,
    pub conversation: String,
    pub knowledge: String,
    pub query: String,
}

/// What went into the context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub chunks_used: usize,
    /// Candidates before any capping or dedup
    pub total_chunks: usize,
    /// Estimated tokens of the knowledge section
    pub estimated_tokens: usize,
    /// Tokens charged for conversation history
    pub history_tokens: usize,
    pub sources: Vec<String>,
    /// Whether any chunk was cut to fit
    pub truncated: bool,
    pub dedup_mode: DedupMode,
    pub degraded: Vec<DegradedStage>,
}

/// Built context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltContext {
    /// Rendered knowledge section
    pub context: String,
    pub prompt_sections: PromptSections,
    pub metadata: ContextMetadata,
}

/// Context builder
pub struct ContextBuilder {
    config: ContextConfig,
    clustering: Option<Arc<dyn ClusteringService>>,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            clustering: None,
        }
    }

    /// Use semantic clustering for dedup instead of hashing
    pub fn with_clustering(mut self, clustering: Arc<dyn ClusteringService>) -> Self {
        self.clustering = Some(clustering);
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the knowledge section and prompt sections for `query`
    ///
    /// Never fails: a clustering error falls back to hash dedup and a
    /// history error leaves the conversation section empty. Both are
    /// reported in `metadata.degraded`.
    pub async fn build_context(
        &self,
        query: &str,
        intents: &[IntentKind],
        results: Vec<RetrievalResult>,
        history: Option<&dyn ConversationContextProvider>,
    ) -> BuiltContext {
        let start = Instant::now();
        let total_chunks = results.len();
        let mut degraded = Vec::new();

        let capped = source::cap_per_source(results, self.config.pre_cap_per_source);

        let (deduped, dedup_mode) = match &self.clustering {
            Some(clustering) => {
                match dedup::cluster_dedup(
                    clustering.as_ref(),
                    capped.clone(),
                    self.config.cluster_threshold,
                    query,
                    intents,
                )
                .await
                {
                    Ok(deduped) => (deduped, DedupMode::Clustering),
                    Err(e) => {
                        tracing::warn!(error = %e, "Clustering failed, using hash dedup");
                        record_degraded(DegradedStage::Clustering);
                        degraded.push(DegradedStage::Clustering);
                        (dedup::hash_dedup(capped), DedupMode::Hash)
                    },
                }
            },
            None => (dedup::hash_dedup(capped), DedupMode::Hash),
        };

        let ordered = source::cap_per_source(deduped, self.config.post_cap_per_source);

        let (conversation, history_tokens) = match history {
            Some(provider) => match provider.context_for(query).await {
                Ok(snippet) => self.fit_history(snippet),
                Err(e) => {
                    tracing::warn!(error = %e, "Conversation context unavailable");
                    record_degraded(DegradedStage::ConversationContext);
                    degraded.push(DegradedStage::ConversationContext);
                    (String::new(), 0)
                },
            },
            None => (String::new(), 0),
        };

        let allowance = budget::knowledge_allowance(&self.config, history_tokens);
        let style = self.config.style;
        let include_citations = self.config.include_citations;
        let selected = budget::select_within_budget(
            ordered,
            allowance,
            self.config.min_chunk_tokens,
            self.config.max_chunks,
            |result, position| format::frame(result, position, style, include_citations).tokens(),
        );

        let knowledge = format::format_knowledge(&selected, style, include_citations);

        let sources: Vec<String> = selected
            .iter()
            .map(|c| source::resolve_source_id(&c.result))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let metadata = ContextMetadata {
            chunks_used: selected.len(),
            total_chunks,
            estimated_tokens: estimate_tokens(&knowledge),
            history_tokens,
            sources,
            truncated: selected.iter().any(|c| c.truncated),
            dedup_mode,
            degraded,
        };

        tracing::debug!(
            chunks_used = metadata.chunks_used,
            total_chunks,
            allowance,
            tokens = metadata.estimated_tokens,
            dedup = ?metadata.dedup_mode,
            "Built context"
        );
        record_stage_latency("context", start.elapsed());

        BuiltContext {
            prompt_sections: PromptSections {
                system: self.config.system_prompt.clone(),
                conversation,
                knowledge: knowledge.clone(),
                query: query.to_string(),
            },
            context: knowledge,
            metadata,
        }
    }

    /// History text and the tokens charged for it
    ///
    /// The provider's count is used as is when it fits the allowance. Longer
    /// history is cut to the allowance and the kept part re-estimated.
    fn fit_history(&self, snippet: ConversationSnippet) -> (String, usize) {
        let limit = self.config.history_tokens;
        let reported = if snippet.tokens == 0 && !snippet.text.is_empty() {
            estimate_tokens(&snippet.text)
        } else {
            snippet.tokens
        };
        if reported <= limit {
            return (snippet.text, reported);
        }

        match truncate_to_tokens(&snippet.text, limit) {
            // The provider counts more than the estimate; trust its count
            Some(cut) if cut.text.len() == snippet.text.trim_end().len() => (cut.text, limit),
            Some(cut) => (cut.text, cut.tokens),
            None => (String::new(), 0),
        }
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}
