//! Knowledge chunks
//!
//! A chunk is the unit of retrievable text. Chunks are produced by an
//! external ingestion step and are immutable once indexed.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::query::IntentKind;

/// Typed chunk identifier
///
/// `ChunkId::new` is the only constructor. Fragment ids are derived through
/// [`ChunkId::part`], which replaces an existing `#pN` suffix instead of
/// stacking a second one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    const PART_MARKER: &'static str = "#p";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id without any fragment suffix
    pub fn base(&self) -> &str {
        match self.0.rfind(Self::PART_MARKER) {
            Some(pos) => {
                let suffix = &self.0[pos + Self::PART_MARKER.len()..];
                if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                    &self.0[..pos]
                } else {
                    &self.0
                }
            },
            None => &self.0,
        }
    }

    /// Derive the id of fragment `ordinal` of this chunk's document
    pub fn part(&self, ordinal: u32) -> Self {
        Self(format!("{}{}{}", self.base(), Self::PART_MARKER, ordinal))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChunkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Structured chunk metadata
///
/// Well-known keys are explicit optional fields; anything else lands in
/// `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMetadata {
    pub source_id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub tags: Vec<String>,
    pub section: Option<String>,
    pub parent_chunk: Option<ChunkId>,
    pub chunk_part: Option<u32>,
    /// "stable" or "volatile"
    pub stability: Option<String>,
    pub volatile: bool,
    pub as_of: Option<NaiveDate>,
    pub verified: Option<bool>,
    pub status: Option<String>,
    pub exclude_from_tech: bool,
    pub url: Option<String>,
    pub path: Option<String>,
    pub collection_id: Option<String>,
    pub doc_key: Option<String>,
    pub domain: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ChunkMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent: ChunkId, part: Option<u32>) -> Self {
        self.parent_chunk = Some(parent);
        self.chunk_part = part;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Volatile either through the flag or the stability label
    pub fn is_volatile(&self) -> bool {
        self.volatile
            || self
                .stability
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("volatile"))
    }

    /// Uniform field lookup used by filters
    pub fn field(&self, name: &str) -> Option<Value> {
        let string = |v: &Option<String>| v.clone().map(Value::String);
        match name {
            "source_id" => string(&self.source_id),
            "title" => string(&self.title),
            "type" | "kind" => string(&self.kind),
            "section" => string(&self.section),
            "stability" => string(&self.stability),
            "status" => string(&self.status),
            "url" => string(&self.url),
            "path" => string(&self.path),
            "collection_id" => string(&self.collection_id),
            "doc_key" => string(&self.doc_key),
            "domain" => string(&self.domain),
            "parent_chunk" => self
                .parent_chunk
                .as_ref()
                .map(|p| Value::String(p.as_str().to_string())),
            "chunk_part" => self.chunk_part.map(Value::from),
            "verified" => self.verified.map(Value::Bool),
            "volatile" => Some(Value::Bool(self.is_volatile())),
            "exclude_from_tech" => Some(Value::Bool(self.exclude_from_tech)),
            "as_of" => self.as_of.map(|d| Value::String(d.to_string())),
            "tags" => Some(Value::Array(
                self.tags.iter().cloned().map(Value::String).collect(),
            )),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Number of populated fields, used as a tie-breaker
    pub fn richness(&self) -> usize {
        let optional = [
            self.source_id.is_some(),
            self.title.is_some(),
            self.kind.is_some(),
            self.section.is_some(),
            self.parent_chunk.is_some(),
            self.chunk_part.is_some(),
            self.stability.is_some(),
            self.as_of.is_some(),
            self.verified.is_some(),
            self.status.is_some(),
            self.url.is_some(),
            self.path.is_some(),
            self.collection_id.is_some(),
            self.doc_key.is_some(),
            self.domain.is_some(),
            !self.tags.is_empty(),
        ];
        optional.iter().filter(|set| **set).count() + self.extra.len()
    }
}

/// Structured sidecar rendered alongside a chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaCard {
    pub contract_address: Option<String>,
    pub ticker: Option<String>,
    pub blockchain: Option<String>,
    /// Official channel name -> link
    pub channels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MetaCard {
    pub fn has_contract_address(&self) -> bool {
        self.contract_address.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_ticker(&self) -> bool {
        self.ticker.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_channels(&self) -> bool {
        !self.channels.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_contract_address()
            && !self.has_ticker()
            && self.blockchain.is_none()
            && self.channels.is_empty()
            && self.extra.is_empty()
    }

    /// Whether the card carries the field a query with this intent asks for
    pub fn matches_intent(&self, intent: IntentKind) -> bool {
        match intent {
            IntentKind::ContractAddress => self.has_contract_address(),
            IntentKind::TickerSymbol => self.has_ticker(),
            IntentKind::OfficialChannel => self.has_channels(),
            IntentKind::TechnicalSpecs => self.blockchain.is_some(),
        }
    }
}

/// Unit of retrievable knowledge text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Display/dense form
    pub text: String,
    /// Keyword-indexing form
    #[serde(default)]
    pub search_text: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub meta_card: Option<MetaCard>,
}

impl Chunk {
    pub fn new(id: ChunkId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            search_text: None,
            embedding: None,
            metadata: ChunkMetadata::default(),
            meta_card: None,
        }
    }

    pub fn with_search_text(mut self, search_text: impl Into<String>) -> Self {
        self.search_text = Some(search_text.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta_card(mut self, card: MetaCard) -> Self {
        self.meta_card = Some(card);
        self
    }
}
