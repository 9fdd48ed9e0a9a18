//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{aggregation, context, fusion, keyword, observability, reranker, retrieval, vector};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Relaxed validation
    #[default]
    Development,
    Staging,
    /// Referenced files must exist
    Production,
}

impl RuntimeEnvironment {
    /// Check if strict validation should be applied
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main engine settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// BM25 keyword index
    #[serde(default)]
    pub keyword: KeywordSettings,

    /// Dense vector store
    #[serde(default)]
    pub vector: VectorSettings,

    /// Hybrid retrieval and fusion weights
    #[serde(default)]
    pub retrieval: RetrievalSettings,

    /// Relevance reranker
    #[serde(default)]
    pub reranker: RerankerSettings,

    /// Parent/child aggregation
    #[serde(default)]
    pub aggregation: AggregationSettings,

    /// Context building and token budget
    #[serde(default)]
    pub context: ContextSettings,

    /// Optional glossary YAML used for query expansion
    #[serde(default)]
    pub glossary_path: Option<String>,
}

/// BM25 parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordSettings {
    #[serde(default = "default_k1")]
    pub k1: f32,
    #[serde(default = "default_b")]
    pub b: f32,
    #[serde(default = "default_keyword_min_score")]
    pub min_score: f32,
}

fn default_k1() -> f32 {
    keyword::K1
}
fn default_b() -> f32 {
    keyword::B
}
fn default_keyword_min_score() -> f32 {
    keyword::MIN_SCORE
}

impl Default for KeywordSettings {
    fn default() -> Self {
        Self {
            k1: default_k1(),
            b: default_b(),
            min_score: default_keyword_min_score(),
        }
    }
}

/// Vector store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSettings {
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// JSON snapshot restored into both indexes at engine startup when the
    /// file exists; written by `persist`
    #[serde(default)]
    pub persist_path: Option<String>,
}

fn default_dimension() -> usize {
    vector::DIMENSION
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            persist_path: None,
        }
    }
}

/// Retrieval orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Base dense weight (keyword weight is the complement)
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f32,

    /// Floor for the dense weight after intent adjustments
    #[serde(default = "default_min_dense_weight")]
    pub min_dense_weight: f32,

    #[serde(default = "default_dense_top_k")]
    pub dense_top_k: usize,

    #[serde(default = "default_keyword_top_k")]
    pub keyword_top_k: usize,

    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,

    #[serde(default = "default_retrieval_min_score")]
    pub min_score: f32,

    #[serde(default = "default_staleness_days")]
    pub staleness_days: i64,

    #[serde(default = "default_staleness_penalty")]
    pub staleness_penalty: f32,

    /// Weight of the fused score in the post-rerank blend
    #[serde(default = "default_rerank_prior_weight")]
    pub rerank_prior_weight: f32,

    /// Aggregate results into parent blocks
    #[serde(default = "default_true")]
    pub aggregate: bool,
}

fn default_dense_weight() -> f32 {
    fusion::DENSE_WEIGHT
}
fn default_min_dense_weight() -> f32 {
    fusion::MIN_DENSE_WEIGHT
}
fn default_dense_top_k() -> usize {
    retrieval::DENSE_TOP_K
}
fn default_keyword_top_k() -> usize {
    retrieval::KEYWORD_TOP_K
}
fn default_final_top_k() -> usize {
    retrieval::FINAL_TOP_K
}
fn default_retrieval_min_score() -> f32 {
    retrieval::MIN_SCORE
}
fn default_staleness_days() -> i64 {
    retrieval::STALENESS_DAYS
}
fn default_staleness_penalty() -> f32 {
    retrieval::STALENESS_PENALTY
}
fn default_rerank_prior_weight() -> f32 {
    retrieval::RERANK_PRIOR_WEIGHT
}
fn default_true() -> bool {
    true
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            dense_weight: default_dense_weight(),
            min_dense_weight: default_min_dense_weight(),
            dense_top_k: default_dense_top_k(),
            keyword_top_k: default_keyword_top_k(),
            final_top_k: default_final_top_k(),
            min_score: default_retrieval_min_score(),
            staleness_days: default_staleness_days(),
            staleness_penalty: default_staleness_penalty(),
            rerank_prior_weight: default_rerank_prior_weight(),
            aggregate: true,
        }
    }
}

/// Relevance reranker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_model_timeout_ms")]
    pub model_timeout_ms: u64,

    /// ONNX cross-encoder model (requires the `onnx` feature)
    #[serde(default)]
    pub model_path: Option<String>,

    #[serde(default)]
    pub tokenizer_path: Option<String>,

    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

fn default_batch_size() -> usize {
    reranker::BATCH_SIZE
}
fn default_model_timeout_ms() -> u64 {
    reranker::MODEL_TIMEOUT_MS
}
fn default_max_seq_len() -> usize {
    reranker::MAX_SEQ_LEN
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            model_timeout_ms: default_model_timeout_ms(),
            model_path: None,
            tokenizer_path: None,
            max_seq_len: default_max_seq_len(),
        }
    }
}

/// How child scores combine into a parent score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// 0.7 * max + 0.3 * mean
    #[default]
    WeightedMax,
    Max,
    Mean,
}

/// Parent/child aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    #[serde(default)]
    pub strategy: AggregationStrategy,

    #[serde(default = "default_min_parent_tokens")]
    pub min_parent_tokens: usize,

    #[serde(default = "default_max_parent_tokens")]
    pub max_parent_tokens: usize,

    #[serde(default = "default_max_parents")]
    pub max_parents: usize,
}

fn default_min_parent_tokens() -> usize {
    aggregation::MIN_PARENT_TOKENS
}
fn default_max_parent_tokens() -> usize {
    aggregation::MAX_PARENT_TOKENS
}
fn default_max_parents() -> usize {
    aggregation::MAX_PARENTS
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::default(),
            min_parent_tokens: default_min_parent_tokens(),
            max_parent_tokens: default_max_parent_tokens(),
            max_parents: default_max_parents(),
        }
    }
}

/// Output style of the knowledge section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextStyle {
    /// `[n] Title (source)` headers with `---` separators
    #[default]
    Structured,
    /// Bullet list
    Conversational,
    /// Blank-line concatenation
    Minimal,
}

/// Context builder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_total_tokens")]
    pub total_tokens: usize,

    #[serde(default = "default_system_prompt_tokens")]
    pub system_prompt_tokens: usize,

    #[serde(default = "default_query_tokens")]
    pub query_tokens: usize,

    /// Allowance for conversation history
    #[serde(default = "default_history_tokens")]
    pub history_tokens: usize,

    /// Upper bound on the knowledge section
    #[serde(default = "default_knowledge_tokens")]
    pub knowledge_tokens: usize,

    #[serde(default = "default_min_chunk_tokens")]
    pub min_chunk_tokens: usize,

    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    #[serde(default = "default_pre_cap")]
    pub pre_cap_per_source: usize,

    #[serde(default = "default_post_cap")]
    pub post_cap_per_source: usize,

    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f32,

    #[serde(default)]
    pub style: ContextStyle,

    #[serde(default = "default_true")]
    pub include_citations: bool,

    /// System prompt placed in the `system` section
    #[serde(default)]
    pub system_prompt: String,
}

fn default_total_tokens() -> usize {
    context::TOTAL_TOKENS
}
fn default_system_prompt_tokens() -> usize {
    context::SYSTEM_PROMPT_TOKENS
}
fn default_query_tokens() -> usize {
    context::QUERY_TOKENS
}
fn default_history_tokens() -> usize {
    context::HISTORY_TOKENS
}
fn default_knowledge_tokens() -> usize {
    context::KNOWLEDGE_TOKENS
}
fn default_min_chunk_tokens() -> usize {
    context::MIN_CHUNK_TOKENS
}
fn default_max_chunks() -> usize {
    context::MAX_CHUNKS
}
fn default_pre_cap() -> usize {
    context::PRE_CAP_PER_SOURCE
}
fn default_post_cap() -> usize {
    context::POST_CAP_PER_SOURCE
}
fn default_cluster_threshold() -> f32 {
    context::CLUSTER_THRESHOLD
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            total_tokens: default_total_tokens(),
            system_prompt_tokens: default_system_prompt_tokens(),
            query_tokens: default_query_tokens(),
            history_tokens: default_history_tokens(),
            knowledge_tokens: default_knowledge_tokens(),
            min_chunk_tokens: default_min_chunk_tokens(),
            max_chunks: default_max_chunks(),
            pre_cap_per_source: default_pre_cap(),
            post_cap_per_source: default_post_cap(),
            cluster_threshold: default_cluster_threshold(),
            style: ContextStyle::default(),
            include_citations: true,
            system_prompt: String::new(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Emit counters and stage histograms; applied by `init_tracing`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    observability::LOG_LEVEL.to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_keyword()?;
        self.validate_vector()?;
        self.validate_retrieval()?;
        self.validate_reranker()?;
        self.validate_aggregation()?;
        self.validate_context()?;
        self.validate_paths()?;
        Ok(())
    }

    fn validate_keyword(&self) -> Result<(), ConfigError> {
        let kw = &self.keyword;

        if !(kw.k1 > 0.0) {
            return Err(invalid("keyword.k1", format!("Must be positive, got {}", kw.k1)));
        }
        check_unit("keyword.b", kw.b)?;
        if !(kw.min_score >= 0.0) {
            return Err(invalid(
                "keyword.min_score",
                format!("Must be non-negative, got {}", kw.min_score),
            ));
        }

        Ok(())
    }

    fn validate_vector(&self) -> Result<(), ConfigError> {
        if self.vector.dimension == 0 {
            return Err(invalid("vector.dimension", "Dimension cannot be 0".to_string()));
        }
        Ok(())
    }

    fn validate_retrieval(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;

        check_unit("retrieval.dense_weight", r.dense_weight)?;
        check_unit("retrieval.min_score", r.min_score)?;
        check_unit("retrieval.staleness_penalty", r.staleness_penalty)?;
        check_unit("retrieval.rerank_prior_weight", r.rerank_prior_weight)?;

        if !(0.0..=fusion::MAX_MIN_DENSE_WEIGHT).contains(&r.min_dense_weight) {
            return Err(invalid(
                "retrieval.min_dense_weight",
                format!(
                    "Must be between 0.0 and {}, got {}",
                    fusion::MAX_MIN_DENSE_WEIGHT,
                    r.min_dense_weight
                ),
            ));
        }

        if r.dense_weight < r.min_dense_weight {
            return Err(invalid(
                "retrieval.dense_weight",
                format!(
                    "Must be at least min_dense_weight ({}), got {}",
                    r.min_dense_weight, r.dense_weight
                ),
            ));
        }

        for (field, value) in [
            ("retrieval.dense_top_k", r.dense_top_k),
            ("retrieval.keyword_top_k", r.keyword_top_k),
            ("retrieval.final_top_k", r.final_top_k),
        ] {
            if value == 0 {
                return Err(invalid(field, "Must be greater than 0".to_string()));
            }
        }

        if r.staleness_days < 0 {
            return Err(invalid(
                "retrieval.staleness_days",
                format!("Must be non-negative, got {}", r.staleness_days),
            ));
        }

        Ok(())
    }

    fn validate_reranker(&self) -> Result<(), ConfigError> {
        let rr = &self.reranker;

        if rr.batch_size == 0 {
            return Err(invalid("reranker.batch_size", "Must be greater than 0".to_string()));
        }
        if rr.model_timeout_ms == 0 {
            return Err(invalid(
                "reranker.model_timeout_ms",
                "Must be greater than 0".to_string(),
            ));
        }
        if rr.max_seq_len < 16 {
            return Err(invalid(
                "reranker.max_seq_len",
                format!("Too short (minimum 16), got {}", rr.max_seq_len),
            ));
        }

        Ok(())
    }

    fn validate_aggregation(&self) -> Result<(), ConfigError> {
        let a = &self.aggregation;

        if a.max_parents == 0 {
            return Err(invalid("aggregation.max_parents", "Must be greater than 0".to_string()));
        }
        if a.min_parent_tokens > a.max_parent_tokens {
            return Err(invalid(
                "aggregation.min_parent_tokens",
                format!(
                    "Must not exceed max_parent_tokens ({}), got {}",
                    a.max_parent_tokens, a.min_parent_tokens
                ),
            ));
        }

        Ok(())
    }

    fn validate_context(&self) -> Result<(), ConfigError> {
        let c = &self.context;

        let reserved = c.system_prompt_tokens + c.query_tokens + c.history_tokens;
        if reserved >= c.total_tokens {
            return Err(invalid(
                "context.total_tokens",
                format!(
                    "Reservations ({}) leave no room for knowledge in {} tokens",
                    reserved, c.total_tokens
                ),
            ));
        }

        if c.min_chunk_tokens > c.knowledge_tokens {
            return Err(invalid(
                "context.min_chunk_tokens",
                format!(
                    "Must not exceed knowledge_tokens ({}), got {}",
                    c.knowledge_tokens, c.min_chunk_tokens
                ),
            ));
        }

        if c.max_chunks == 0 {
            return Err(invalid("context.max_chunks", "Must be greater than 0".to_string()));
        }

        if c.post_cap_per_source == 0 || c.pre_cap_per_source < c.post_cap_per_source {
            return Err(invalid(
                "context.post_cap_per_source",
                format!(
                    "Need 1 <= post_cap <= pre_cap, got post_cap={} pre_cap={}",
                    c.post_cap_per_source, c.pre_cap_per_source
                ),
            ));
        }

        if !(c.cluster_threshold > 0.0 && c.cluster_threshold <= 1.0) {
            return Err(invalid(
                "context.cluster_threshold",
                format!("Must be in (0.0, 1.0], got {}", c.cluster_threshold),
            ));
        }

        Ok(())
    }

    /// Referenced files must exist in strict environments
    fn validate_paths(&self) -> Result<(), ConfigError> {
        let paths = [
            ("glossary_path", self.glossary_path.as_deref()),
            ("reranker.model_path", self.reranker.model_path.as_deref()),
            ("reranker.tokenizer_path", self.reranker.tokenizer_path.as_deref()),
        ];

        for (field, path) in paths {
            let Some(path) = path else { continue };
            if Path::new(path).exists() {
                continue;
            }
            if self.environment.is_strict() {
                return Err(ConfigError::FileNotFound(format!("{}: {}", field, path)));
            }
            tracing::warn!(field, path, "Configured file not found");
        }

        Ok(())
    }
}

fn check_unit(field: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("Must be between 0.0 and 1.0, got {}", value)))
    }
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (GROUNDING__ prefix, e.g. `GROUNDING__KEYWORD__K1=1.5`)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("GROUNDING")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
