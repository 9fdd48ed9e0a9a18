//! In-process vector store
//!
//! Dense vector storage and cosine similarity search over a linear scan.
//! State can be snapshotted to JSON and rehydrated without re-embedding.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use grounding_config::constants::vector;
use grounding_config::VectorSettings;
use grounding_core::{Chunk, ChunkId, ChunkMetadata, MetaCard, RetrievalResult, SearchSource};

use crate::telemetry::increment_counter;
use crate::RagError;

const SNAPSHOT_VERSION: u32 = 1;

/// Vector store configuration
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    /// Embedding dimension every stored vector must have
    pub dimension: usize,
    /// Snapshot location used by `save_default`/`load_default`
    pub persist_path: Option<PathBuf>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            dimension: vector::DIMENSION,
            persist_path: None,
        }
    }
}

impl From<&VectorSettings> for VectorStoreConfig {
    fn from(settings: &VectorSettings) -> Self {
        Self {
            dimension: settings.dimension,
            persist_path: settings.persist_path.as_ref().map(PathBuf::from),
        }
    }
}

/// Stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVector {
    pub id: ChunkId,
    pub embedding: Vec<f32>,
    pub text: String,
    /// Keyword form, kept so a snapshot can rebuild the keyword index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub meta_card: Option<MetaCard>,
}

impl From<StoredVector> for Chunk {
    fn from(stored: StoredVector) -> Self {
        Chunk {
            id: stored.id,
            text: stored.text,
            search_text: stored.search_text,
            embedding: Some(stored.embedding),
            metadata: stored.metadata,
            meta_card: stored.meta_card,
        }
    }
}

/// Serialized store contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSnapshot {
    pub version: u32,
    pub dimension: usize,
    pub entries: Vec<StoredVector>,
}

impl VectorSnapshot {
    fn check_dimensions(&self) -> Result<(), RagError> {
        match self.entries.iter().find(|e| e.embedding.len() != self.dimension) {
            Some(bad) => Err(RagError::Persistence(format!(
                "Entry {} has dimension {}, snapshot declares {}",
                bad.id,
                bad.embedding.len(),
                self.dimension
            ))),
            None => Ok(()),
        }
    }

    /// Stored entries as indexable chunks
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.entries.into_iter().map(Chunk::from).collect()
    }
}

/// Metadata predicate applied before truncation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchFilter {
    /// At least one tag in common
    TagsAny(Vec<String>),
    /// Field equals value (array fields: contains value)
    Eq { field: String, value: Value },
    /// Field absent or different
    NotEq { field: String, value: Value },
    /// Field equals one of the values
    In { field: String, values: Vec<Value> },
    Or(Vec<SearchFilter>),
    And(Vec<SearchFilter>),
}

impl SearchFilter {
    pub fn tags_any<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::TagsAny(tags.into_iter().map(Into::into).collect())
    }

    pub fn field_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field_not_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::NotEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        match self {
            Self::TagsAny(tags) => tags.iter().any(|t| metadata.tags.contains(t)),
            Self::Eq { field, value } => field_matches(metadata, field, value),
            Self::NotEq { field, value } => !field_matches(metadata, field, value),
            Self::In { field, values } => values.iter().any(|v| field_matches(metadata, field, v)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(metadata)),
            Self::And(filters) => filters.iter().all(|f| f.matches(metadata)),
        }
    }
}

fn field_matches(metadata: &ChunkMetadata, field: &str, expected: &Value) -> bool {
    match metadata.field(field) {
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(actual) => &actual == expected,
        None => false,
    }
}

/// Cosine similarity; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// One immutable store generation
///
/// Searches run against a pinned generation, so a concurrent rebuild never
/// shows them a partially replaced store.
#[derive(Debug, Clone)]
pub struct VectorGeneration {
    dimension: usize,
    entries: BTreeMap<ChunkId, StoredVector>,
}

impl VectorGeneration {
    fn empty(dimension: usize) -> Self {
        Self {
            dimension,
            entries: BTreeMap::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `k` entries by cosine similarity
    ///
    /// The filter is applied before truncation. No score threshold is applied.
    pub fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        if query_embedding.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query_embedding.len(),
            });
        }

        increment_counter("grounding_rag_dense_searches_total");

        let mut scored: Vec<(f32, &StoredVector)> = self
            .entries
            .values()
            .filter(|e| filter.map_or(true, |f| f.matches(&e.metadata)))
            .map(|e| (cosine_similarity(query_embedding, &e.embedding), e))
            .collect();

        scored.sort_by(|x, y| y.0.total_cmp(&x.0).then_with(|| x.1.id.cmp(&y.1.id)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, entry)| {
                let mut result =
                    RetrievalResult::new(entry.id.clone(), entry.text.clone(), score, SearchSource::Dense);
                result.metadata = entry.metadata.clone();
                result.meta_card = entry.meta_card.clone();
                result.embedding = Some(entry.embedding.clone());
                result.dense_score = Some(score);
                result
            })
            .collect())
    }
}

/// Brute-force cosine vector store
pub struct VectorStore {
    state: RwLock<Arc<VectorGeneration>>,
    persist_path: Option<PathBuf>,
}

impl VectorStore {
    pub fn new(config: VectorStoreConfig) -> Self {
        Self {
            state: RwLock::new(Arc::new(VectorGeneration::empty(config.dimension))),
            persist_path: config.persist_path,
        }
    }

    pub fn dimension(&self) -> usize {
        self.state.read().dimension
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Current generation; it stays valid after later writes
    pub fn pin(&self) -> Arc<VectorGeneration> {
        Arc::clone(&self.state.read())
    }

    /// Add or replace a chunk
    pub fn add(&self, chunk: &Chunk) -> Result<(), RagError> {
        let mut state = self.state.write();
        let record = Self::record_for(chunk, state.dimension)?;
        Arc::make_mut(&mut *state).entries.insert(record.id.clone(), record);
        Ok(())
    }

    /// Add many chunks; nothing is stored if any embedding is invalid
    pub fn add_batch(&self, chunks: &[Chunk]) -> Result<usize, RagError> {
        let mut state = self.state.write();
        let records = chunks
            .iter()
            .map(|c| Self::record_for(c, state.dimension))
            .collect::<Result<Vec<_>, _>>()?;

        let count = records.len();
        let generation = Arc::make_mut(&mut *state);
        for record in records {
            generation.entries.insert(record.id.clone(), record);
        }
        Ok(count)
    }

    /// Build a complete replacement generation without touching the store
    pub fn prepare(&self, chunks: &[Chunk]) -> Result<VectorGeneration, RagError> {
        let dimension = self.dimension();
        let entries = chunks
            .iter()
            .map(|c| Self::record_for(c, dimension).map(|r| (r.id.clone(), r)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(VectorGeneration { dimension, entries })
    }

    /// Swap in a prepared generation
    pub fn publish(&self, generation: VectorGeneration) -> usize {
        let count = generation.len();
        *self.state.write() = Arc::new(generation);
        count
    }

    /// Replace the whole contents in one swap
    pub fn replace_all(&self, chunks: &[Chunk]) -> Result<usize, RagError> {
        let generation = self.prepare(chunks)?;
        Ok(self.publish(generation))
    }

    fn record_for(chunk: &Chunk, dimension: usize) -> Result<StoredVector, RagError> {
        let embedding = chunk.embedding.as_ref().ok_or_else(|| {
            RagError::Index(format!("Chunk {} has no embedding", chunk.id))
        })?;
        if embedding.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: embedding.len(),
            });
        }
        Ok(StoredVector {
            id: chunk.id.clone(),
            embedding: embedding.clone(),
            text: chunk.text.clone(),
            search_text: chunk.search_text.clone(),
            metadata: chunk.metadata.clone(),
            meta_card: chunk.meta_card.clone(),
        })
    }

    pub fn remove(&self, id: &ChunkId) -> bool {
        let mut state = self.state.write();
        if !state.entries.contains_key(id) {
            return false;
        }
        Arc::make_mut(&mut *state).entries.remove(id).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        let dimension = state.dimension;
        *state = Arc::new(VectorGeneration::empty(dimension));
    }

    /// Top `k` entries by cosine similarity against the current generation
    pub fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<RetrievalResult>, RagError> {
        self.pin().search(query_embedding, k, filter)
    }

    pub fn to_snapshot(&self) -> VectorSnapshot {
        let generation = self.pin();
        VectorSnapshot {
            version: SNAPSHOT_VERSION,
            dimension: generation.dimension,
            entries: generation.entries.values().cloned().collect(),
        }
    }

    /// Replace the whole store with a snapshot
    ///
    /// A different snapshot dimension is adopted with a warning. Entries that
    /// disagree with the snapshot's own dimension reject the whole snapshot.
    pub fn restore(&self, snapshot: VectorSnapshot) -> Result<usize, RagError> {
        snapshot.check_dimensions()?;

        let generation = VectorGeneration {
            dimension: snapshot.dimension,
            entries: snapshot
                .entries
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
        };
        let count = generation.len();

        let mut state = self.state.write();
        if state.dimension != generation.dimension {
            tracing::warn!(
                configured = state.dimension,
                loaded = generation.dimension,
                "Vector snapshot dimension differs from configuration, adopting loaded dimension"
            );
        }
        *state = Arc::new(generation);

        Ok(count)
    }

    pub fn from_snapshot(snapshot: VectorSnapshot) -> Result<Self, RagError> {
        let store = Self::new(VectorStoreConfig {
            dimension: snapshot.dimension,
            persist_path: None,
        });
        store.restore(snapshot)?;
        Ok(store)
    }

    /// Write the store as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RagError> {
        let path = path.as_ref();
        let snapshot = self.to_snapshot();
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| RagError::Persistence(format!("Failed to serialize store: {}", e)))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        tracing::info!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            dimension = snapshot.dimension,
            "Vector store saved"
        );
        Ok(())
    }

    /// Parse a JSON snapshot without applying it
    pub fn read_snapshot(path: impl AsRef<Path>) -> Result<VectorSnapshot, RagError> {
        let path = path.as_ref();
        let content = std::fs::read(path)?;
        let snapshot: VectorSnapshot = serde_json::from_slice(&content).map_err(|e| {
            RagError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        snapshot.check_dimensions()?;
        Ok(snapshot)
    }

    /// Replace the store with a JSON snapshot from disk
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize, RagError> {
        let path = path.as_ref();
        let count = self.restore(Self::read_snapshot(path)?)?;
        tracing::info!(path = %path.display(), entries = count, "Vector store loaded");
        Ok(count)
    }

    /// Save to the configured persist path, if any
    pub fn save_default(&self) -> Result<bool, RagError> {
        match &self.persist_path {
            Some(path) => self.save(path).map(|_| true),
            None => Ok(false),
        }
    }

    /// Load from the configured persist path when the file exists
    pub fn load_default(&self) -> Result<usize, RagError> {
        match &self.persist_path {
            Some(path) if path.exists() => self.load(path),
            _ => Ok(0),
        }
    }
}

impl Default for VectorStore {
    fn default() -> Self {
        Self::new(VectorStoreConfig::default())
    }
}
