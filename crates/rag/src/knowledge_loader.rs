//! Knowledge corpus loader
//!
//! Reads chunk corpora from YAML/JSON files so an engine can be populated
//! without a separate ingestion service.

use std::path::{Path, PathBuf};

use grounding_core::{Chunk, Embedder};
use serde::{Deserialize, Serialize};

use crate::RagError;

/// Corpus file format
///
/// ```yaml
/// version: "1"
/// chunks:
///   - id: staking-guide#p1
///     text: Staking rewards are paid every epoch.
///     metadata:
///       source_id: docs/staking
///       title: Staking guide
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

/// Loads knowledge files from disk
pub struct KnowledgeLoader;

impl KnowledgeLoader {
    /// Load every `.yaml`, `.yml` and `.json` file in `dir`, in file name order
    ///
    /// A missing directory yields no chunks. Files that fail to parse are
    /// logged and skipped.
    pub fn load_directory(dir: &Path) -> Result<Vec<Chunk>, RagError> {
        if !dir.exists() {
            tracing::warn!(path = %dir.display(), "Knowledge directory does not exist");
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| matches!(extension(path), "yaml" | "yml" | "json"))
            .collect();
        files.sort();

        let mut chunks = Vec::new();
        for path in &files {
            match Self::load_file(path) {
                Ok(file) => {
                    tracing::info!(
                        file = %path.display(),
                        chunks = file.chunks.len(),
                        "Loaded knowledge file"
                    );
                    chunks.extend(file.chunks);
                },
                Err(e) => {
                    tracing::error!(
                        file = %path.display(),
                        error = %e,
                        "Failed to load knowledge file"
                    );
                },
            }
        }

        tracing::info!(
            directory = %dir.display(),
            files = files.len(),
            total_chunks = chunks.len(),
            "Knowledge loading complete"
        );
        Ok(chunks)
    }

    /// Parse a single knowledge file
    pub fn load_file(path: &Path) -> Result<KnowledgeFile, RagError> {
        let content = std::fs::read_to_string(path)?;
        match extension(path) {
            "json" => serde_json::from_str(&content)
                .map_err(|e| RagError::Persistence(format!("JSON parse error: {}", e))),
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| RagError::Persistence(format!("YAML parse error: {}", e))),
            other => Err(RagError::Persistence(format!("Unsupported file type: {}", other))),
        }
    }

    /// Embed chunks that arrived without an embedding; returns how many
    pub async fn embed_missing(
        chunks: &mut [Chunk],
        embedder: &dyn Embedder,
    ) -> Result<usize, RagError> {
        let mut embedded = 0;
        for chunk in chunks.iter_mut().filter(|c| c.embedding.is_none()) {
            let embedding = embedder.embed(&chunk.text).await?;
            if embedding.len() != embedder.dimension() {
                return Err(RagError::DimensionMismatch {
                    expected: embedder.dimension(),
                    actual: embedding.len(),
                });
            }
            chunk.embedding = Some(embedding);
            embedded += 1;
        }
        if embedded > 0 {
            tracing::debug!(embedded, "Embedded chunks without vectors");
        }
        Ok(embedded)
    }
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}
