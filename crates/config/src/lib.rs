//! Configuration management for the grounding engine
//!
//! Supports loading configuration from:
//! - YAML/TOML files (`config/default`, `config/{env}`)
//! - Environment variables (GROUNDING__ prefix, `__` section separator)
//! - A bilingual term glossary used for query expansion

pub mod constants;
pub mod glossary;
pub mod settings;

pub use glossary::{Glossary, GlossaryEntry};
pub use settings::{
    load_settings, AggregationSettings, AggregationStrategy, ContextSettings, ContextStyle, KeywordSettings,
    ObservabilityConfig, RerankerSettings, RetrievalSettings, RuntimeEnvironment, Settings,
    VectorSettings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
