//! Tracing setup and degraded-mode accounting

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use grounding_config::ObservabilityConfig;

/// Optional stage that fell back instead of failing the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedStage {
    /// Relevance model could not be loaded
    ModelLoad,
    /// A relevance model batch failed or timed out
    ModelBatch,
    /// Diversity reranker failed; fused order kept
    Diversity,
    /// Clustering failed or is absent; hash dedup used
    Clustering,
    /// A parent group fell back to its largest child
    ParentBuild,
    /// Conversation history could not be fetched
    ConversationContext,
}

impl DegradedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelLoad => "model_load",
            Self::ModelBatch => "model_batch",
            Self::Diversity => "diversity",
            Self::Clustering => "clustering",
            Self::ParentBuild => "parent_build",
            Self::ConversationContext => "conversation_context",
        }
    }
}

impl fmt::Display for DegradedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static METRICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn metric emission on or off for the whole process
pub fn set_metrics_enabled(enabled: bool) {
    METRICS_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn metrics_enabled() -> bool {
    METRICS_ENABLED.load(Ordering::Relaxed)
}

/// Bump an unlabelled counter
pub fn increment_counter(name: &'static str) {
    if metrics_enabled() {
        metrics::counter!(name).increment(1);
    }
}

/// Count a degraded transition
pub fn record_degraded(stage: DegradedStage) {
    if metrics_enabled() {
        metrics::counter!("grounding_rag_degraded_total", "stage" => stage.as_str()).increment(1);
    }
}

/// Record the latency of one pipeline stage
pub fn record_stage_latency(stage: &'static str, elapsed: Duration) {
    if metrics_enabled() {
        metrics::histogram!("grounding_rag_stage_seconds", "stage" => stage)
            .record(elapsed.as_secs_f64());
    }
}

/// Install the global tracing subscriber and apply the metrics switch
///
/// `RUST_LOG` wins over the configured level. Installing the subscriber
/// twice is a no-op.
pub fn init_tracing(config: &ObservabilityConfig) {
    set_metrics_enabled(config.metrics_enabled);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.log_level;
        format!("grounding_rag={level},grounding_config={level},warn").into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if subscriber.with(fmt_layer).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
