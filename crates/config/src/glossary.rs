//! Bilingual term glossary
//!
//! Loaded from YAML:
//!
//! ```yaml
//! entries:
//!   - term: contract address
//!     translations: ["合约地址", "CA"]
//!   - term: wallet
//!     translations: ["钱包"]
//! ```
//!
//! Lookups are bidirectional: a translation maps back to its term and to the
//! sibling translations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::ConfigError;

/// One glossary entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlossaryEntry {
    pub term: String,
    #[serde(default)]
    pub translations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    entries: Vec<GlossaryEntry>,
}

/// Normalized, bidirectional glossary
#[derive(Debug, Clone, Default)]
pub struct Glossary {
    /// normalized key -> expansions (never contains the key itself)
    lookup: HashMap<String, Vec<String>>,
    /// Keys containing whitespace, longest first
    phrases: Vec<String>,
}

impl Glossary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries
    pub fn from_entries(entries: Vec<GlossaryEntry>) -> Self {
        let mut glossary = Self::default();
        for entry in entries {
            let mut group: Vec<String> = Vec::with_capacity(entry.translations.len() + 1);
            for raw in std::iter::once(&entry.term).chain(entry.translations.iter()) {
                let norm = normalize(raw);
                if !norm.is_empty() && !group.contains(&norm) {
                    group.push(norm);
                }
            }

            for key in &group {
                let expansions = glossary.lookup.entry(key.clone()).or_default();
                for other in group.iter().filter(|o| *o != key) {
                    if !expansions.contains(other) {
                        expansions.push(other.clone());
                    }
                }
            }
        }

        glossary.phrases = glossary
            .lookup
            .keys()
            .filter(|k| k.contains(' '))
            .cloned()
            .collect();
        glossary
            .phrases
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        glossary
    }

    /// Load from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::FileNotFound(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: GlossaryFile =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let glossary = Self::from_entries(file.entries);
        tracing::debug!(keys = glossary.len(), "Loaded glossary");
        Ok(glossary)
    }

    /// Expansions for a single normalized key
    pub fn lookup(&self, key: &str) -> &[String] {
        self.lookup
            .get(&normalize(key))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Every normalized key
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.lookup.keys().map(String::as_str)
    }

    /// Multi-word keys, longest first
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// Lowercase and collapse whitespace
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
