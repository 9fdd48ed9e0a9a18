//! BM25 keyword index
//!
//! Provides keyword-based search for hybrid retrieval. Every build produces a
//! fresh immutable snapshot that is swapped in atomically, so a search always
//! sees one consistent index generation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use grounding_config::constants::keyword;
use grounding_config::KeywordSettings;
use grounding_core::{Chunk, RetrievalResult, SearchSource};

use crate::telemetry::increment_counter;
use crate::tokenizer::{token_stream, tokenize};
use crate::RagError;

/// BM25 configuration
#[derive(Debug, Clone)]
pub struct KeywordConfig {
    /// Term-frequency saturation
    pub k1: f32,
    /// Length normalization
    pub b: f32,
    /// Hits scoring below this are dropped
    pub min_score: f32,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            k1: keyword::K1,
            b: keyword::B,
            min_score: keyword::MIN_SCORE,
        }
    }
}

impl From<&KeywordSettings> for KeywordConfig {
    fn from(settings: &KeywordSettings) -> Self {
        Self {
            k1: settings.k1,
            b: settings.b,
            min_score: settings.min_score,
        }
    }
}

/// Build statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexStats {
    /// Chunks indexed
    pub documents: usize,
    /// Chunks skipped for lacking `search_text`
    pub skipped: usize,
    /// Distinct terms
    pub vocabulary: usize,
    pub avg_doc_length: f32,
    /// Monotonic publish counter, starting at 1
    pub generation: u64,
}

struct IndexedDoc {
    chunk: Chunk,
    length: usize,
}

/// One immutable index generation
struct IndexSnapshot {
    docs: Vec<IndexedDoc>,
    /// term -> (doc index, term frequency)
    postings: HashMap<String, Vec<(usize, u32)>>,
    avg_doc_length: f32,
    stats: IndexStats,
}

impl IndexSnapshot {
    fn build(chunks: &[Chunk]) -> Self {
        let mut docs = Vec::with_capacity(chunks.len());
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut total_tokens = 0usize;
        let mut skipped = 0usize;

        for chunk in chunks {
            let search_text = match chunk.search_text.as_deref() {
                Some(text) if !text.trim().is_empty() => text,
                _ => {
                    tracing::debug!(chunk_id = %chunk.id, "Skipping chunk without search_text");
                    skipped += 1;
                    continue;
                },
            };

            let stream = token_stream(search_text);
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in &stream {
                *tf.entry(token.clone()).or_insert(0) += 1;
            }

            let doc_idx = docs.len();
            for (term, count) in tf {
                postings.entry(term).or_default().push((doc_idx, count));
            }

            total_tokens += stream.len();
            docs.push(IndexedDoc {
                chunk: chunk.clone(),
                length: stream.len(),
            });
        }

        let avg_doc_length = if docs.is_empty() {
            0.0
        } else {
            total_tokens as f32 / docs.len() as f32
        };

        let stats = IndexStats {
            documents: docs.len(),
            skipped,
            vocabulary: postings.len(),
            avg_doc_length,
            generation: 0,
        };

        Self {
            docs,
            postings,
            avg_doc_length,
            stats,
        }
    }
}

/// Inverse document frequency
///
/// `ln((N - df + 0.5) / (df + 0.5))`. Strictly decreasing in `df`; negative
/// for terms present in more than half the corpus.
pub fn idf(total_documents: usize, document_frequency: usize) -> f32 {
    let n = total_documents as f32;
    let df = document_frequency as f32;
    ((n - df + 0.5) / (df + 0.5)).ln()
}

/// Built generation waiting to be published
pub struct PreparedIndex {
    snapshot: IndexSnapshot,
}

impl PreparedIndex {
    pub fn documents(&self) -> usize {
        self.snapshot.docs.len()
    }
}

/// A pinned index generation
///
/// Holds the generation it was taken from even if the index is rebuilt.
#[derive(Clone)]
pub struct PinnedKeywordIndex {
    snapshot: Arc<IndexSnapshot>,
    config: KeywordConfig,
}

impl PinnedKeywordIndex {
    pub fn generation(&self) -> u64 {
        self.snapshot.stats.generation
    }

    /// Score `query` against this generation and return the top `k` hits
    ///
    /// A query with no usable tokens yields an empty list.
    pub fn search(&self, query: &str, k: usize) -> Vec<RetrievalResult> {
        let snapshot = &self.snapshot;
        increment_counter("grounding_rag_keyword_searches_total");

        let terms = tokenize(query);
        if terms.is_empty() || snapshot.docs.is_empty() || k == 0 {
            return Vec::new();
        }

        let n = snapshot.docs.len();
        let k1 = self.config.k1;
        let b = self.config.b;
        let avg_len = snapshot.avg_doc_length.max(f32::EPSILON);

        let mut scores: HashMap<usize, f32> = HashMap::new();
        for term in &terms {
            let Some(postings) = snapshot.postings.get(term) else {
                continue;
            };
            let term_idf = idf(n, postings.len());

            for &(doc_idx, tf) in postings {
                let tf = tf as f32;
                let doc_len = snapshot.docs[doc_idx].length as f32;
                let norm = tf + k1 * (1.0 - b + b * (doc_len / avg_len));
                *scores.entry(doc_idx).or_insert(0.0) += term_idf * (tf * (k1 + 1.0)) / norm;
            }
        }

        let mut ranked: Vec<(usize, f32)> = scores
            .into_iter()
            .filter(|(_, score)| score.is_finite() && *score >= self.config.min_score)
            .collect();

        ranked.sort_by(|x, y| {
            y.1.total_cmp(&x.1)
                .then_with(|| snapshot.docs[x.0].chunk.id.cmp(&snapshot.docs[y.0].chunk.id))
        });
        ranked.truncate(k);

        tracing::debug!(
            query_terms = terms.len(),
            hits = ranked.len(),
            generation = snapshot.stats.generation,
            "Keyword search"
        );

        ranked
            .into_iter()
            .map(|(doc_idx, score)| {
                let mut result = RetrievalResult::from_chunk(
                    &snapshot.docs[doc_idx].chunk,
                    score,
                    SearchSource::Keyword,
                );
                result.bm25_score = Some(score);
                result
            })
            .collect()
    }
}

/// BM25 keyword index
pub struct KeywordIndex {
    config: KeywordConfig,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl KeywordIndex {
    pub fn new(config: KeywordConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &KeywordConfig {
        &self.config
    }

    /// Rebuild the index from scratch
    ///
    /// The new generation is built outside the lock and swapped in once
    /// complete. In-flight searches finish against the previous generation.
    pub fn build_index(&self, chunks: &[Chunk]) -> IndexStats {
        self.publish(Self::prepare(chunks))
    }

    /// Build a generation without publishing it
    pub fn prepare(chunks: &[Chunk]) -> PreparedIndex {
        PreparedIndex {
            snapshot: IndexSnapshot::build(chunks),
        }
    }

    /// Swap in a prepared generation
    ///
    /// The generation number is assigned under the write lock, so numbers
    /// follow publish order even when builds overlap.
    pub fn publish(&self, prepared: PreparedIndex) -> IndexStats {
        let mut snapshot = prepared.snapshot;
        let stats = {
            let mut current = self.snapshot.write();
            let generation = current.as_ref().map_or(0, |s| s.stats.generation) + 1;
            snapshot.stats.generation = generation;
            let stats = snapshot.stats.clone();
            *current = Some(Arc::new(snapshot));
            stats
        };

        if stats.skipped > 0 {
            tracing::warn!(skipped = stats.skipped, "Chunks without search_text were not indexed");
        }
        tracing::info!(
            documents = stats.documents,
            vocabulary = stats.vocabulary,
            avg_doc_length = stats.avg_doc_length,
            generation = stats.generation,
            "Keyword index built"
        );

        stats
    }

    pub fn is_built(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Stats of the current generation
    pub fn stats(&self) -> Option<IndexStats> {
        self.snapshot.read().as_ref().map(|s| s.stats.clone())
    }

    /// Current generation, `None` before the first build
    pub fn pin(&self) -> Option<PinnedKeywordIndex> {
        self.snapshot.read().as_ref().map(|snapshot| PinnedKeywordIndex {
            snapshot: Arc::clone(snapshot),
            config: self.config.clone(),
        })
    }

    /// Score `query` against the current generation and return the top `k` hits
    ///
    /// Errors with [`RagError::IndexNotBuilt`] before the first build.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, RagError> {
        let pinned = self.pin().ok_or(RagError::IndexNotBuilt)?;
        Ok(pinned.search(query, k))
    }
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new(KeywordConfig::default())
    }
}
