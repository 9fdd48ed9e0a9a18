//! RAG engine handle
//!
//! Owns the indexes and pipeline components for one knowledge corpus. Built
//! once from [`Settings`] and shared behind an `Arc`.

use std::path::Path;
use std::sync::Arc;

use grounding_config::{Glossary, Settings};
use grounding_core::{
    Chunk, ClusteringService, ConversationContextProvider, DiversityReranker, Embedder,
    RelevanceModel,
};
use serde::Serialize;

use crate::aggregator::{AggregatorConfig, ParentAggregator};
use crate::context::{BuiltContext, ContextBuilder, ContextConfig};
use crate::keyword_index::{IndexStats, KeywordConfig, KeywordIndex};
use crate::knowledge_loader::KnowledgeLoader;
use crate::query_analysis::QueryAnalyzer;
use crate::reranker::{RelevanceReranker, RerankerConfig};
#[cfg(not(feature = "onnx"))]
use crate::telemetry::{record_degraded, DegradedStage};
use crate::retriever::{RetrievalOutcome, RetrieverConfig, SemanticRetriever};
use crate::vector_store::{VectorStore, VectorStoreConfig};
use crate::RagError;

/// Retrieval outcome plus the context built from it
#[derive(Debug, Clone, Serialize)]
pub struct EngineResponse {
    pub outcome: RetrievalOutcome,
    pub context: BuiltContext,
}

/// Engine over one knowledge corpus
pub struct RagEngine {
    keyword_index: Arc<KeywordIndex>,
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker_config: Option<RerankerConfig>,
    retriever: SemanticRetriever,
    context_builder: ContextBuilder,
}

impl RagEngine {
    /// Build every component from validated settings
    ///
    /// A configured glossary that fails to load is an error. A configured
    /// relevance model that fails to load only degrades reranking. When a
    /// vector snapshot exists at `vector.persist_path` it is loaded into
    /// both indexes.
    pub fn from_settings(settings: &Settings, embedder: Arc<dyn Embedder>) -> Result<Self, RagError> {
        settings.validate()?;

        if embedder.dimension() != settings.vector.dimension {
            return Err(RagError::DimensionMismatch {
                expected: settings.vector.dimension,
                actual: embedder.dimension(),
            });
        }

        let keyword_index = Arc::new(KeywordIndex::new(KeywordConfig::from(&settings.keyword)));
        let vector_store = Arc::new(VectorStore::new(VectorStoreConfig::from(&settings.vector)));

        let mut analyzer = QueryAnalyzer::new();
        if let Some(path) = &settings.glossary_path {
            let glossary = Glossary::load(path)?;
            tracing::info!(path = %path, entries = glossary.len(), "Loaded glossary");
            analyzer = analyzer.with_glossary(Arc::new(glossary));
        }

        let mut retriever = SemanticRetriever::new(
            RetrieverConfig::from(&settings.retrieval),
            Arc::clone(&keyword_index),
            Arc::clone(&vector_store),
            Arc::clone(&embedder),
        )
        .with_analyzer(analyzer)
        .with_aggregator(ParentAggregator::new(AggregatorConfig::from(&settings.aggregation)));

        let reranker_config = settings
            .reranker
            .enabled
            .then(|| RerankerConfig::from(&settings.reranker));
        if let Some(config) = &reranker_config {
            let mut reranker = RelevanceReranker::new(config.clone());
            #[cfg(feature = "onnx")]
            if let Some(model) = crate::cross_encoder::CrossEncoderModel::from_settings(&settings.reranker) {
                reranker = reranker.with_model(Arc::new(model));
            }
            if settings.reranker.model_path.is_some() && !reranker.has_model() {
                #[cfg(not(feature = "onnx"))]
                {
                    tracing::warn!("Relevance model configured without the onnx feature, using fallback scorer");
                    record_degraded(DegradedStage::ModelLoad);
                }
                reranker = reranker.with_model_load_failure();
            }
            retriever = retriever.with_reranker(Arc::new(reranker));
        }

        tracing::info!(
            dimension = settings.vector.dimension,
            reranker = reranker_config.is_some(),
            aggregate = settings.retrieval.aggregate,
            "RAG engine configured"
        );

        let engine = Self {
            keyword_index,
            vector_store,
            embedder,
            reranker_config,
            retriever,
            context_builder: ContextBuilder::new(ContextConfig::from(&settings.context)),
        };
        engine.restore_persisted()?;
        Ok(engine)
    }

    /// Load the snapshot at the configured persist path, if there is one
    fn restore_persisted(&self) -> Result<(), RagError> {
        let Some(path) = self.vector_store.persist_path().filter(|p| p.exists()) else {
            return Ok(());
        };

        let snapshot = VectorStore::read_snapshot(path)?;
        if snapshot.dimension != self.vector_store.dimension() {
            return Err(RagError::DimensionMismatch {
                expected: self.vector_store.dimension(),
                actual: snapshot.dimension,
            });
        }

        let stats = self.retriever.replace_corpus(&snapshot.into_chunks())?;
        tracing::info!(
            path = %path.display(),
            vectors = self.vector_store.len(),
            keyword_documents = stats.documents,
            "Restored persisted corpus"
        );
        Ok(())
    }

    /// Engine with default settings for the embedder's dimension
    pub fn new(embedder: Arc<dyn Embedder>) -> Result<Self, RagError> {
        let mut settings = Settings::default();
        settings.vector.dimension = embedder.dimension();
        Self::from_settings(&settings, embedder)
    }

    /// Use a model for relevance reranking (enables the stage if it was off)
    pub fn with_relevance_model(mut self, model: Arc<dyn RelevanceModel>) -> Self {
        let config = self.reranker_config.clone().unwrap_or_default();
        let reranker = RelevanceReranker::new(config.clone()).with_model(model);
        self.reranker_config = Some(config);
        self.retriever = self.retriever.with_reranker(Arc::new(reranker));
        self
    }

    pub fn with_diversity(mut self, diversity: Arc<dyn DiversityReranker>) -> Self {
        self.retriever = self.retriever.with_diversity(diversity);
        self
    }

    pub fn with_clustering(mut self, clustering: Arc<dyn ClusteringService>) -> Self {
        self.context_builder = self.context_builder.with_clustering(clustering);
        self
    }

    pub fn retriever(&self) -> &SemanticRetriever {
        &self.retriever
    }

    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.vector_store
    }

    pub fn keyword_index(&self) -> &Arc<KeywordIndex> {
        &self.keyword_index
    }

    /// Replace both indexes with `chunks`
    ///
    /// Chunks without an embedding are embedded first. Every vector is
    /// checked before either index is touched, and both indexes switch to
    /// the new corpus together.
    pub async fn index(&self, mut chunks: Vec<Chunk>) -> Result<IndexStats, RagError> {
        KnowledgeLoader::embed_missing(&mut chunks, self.embedder.as_ref()).await?;

        let dimension = self.vector_store.dimension();
        if let Some(bad) = chunks
            .iter()
            .filter_map(|c| c.embedding.as_ref())
            .find(|e| e.len() != dimension)
        {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        let stats = self.retriever.replace_corpus(&chunks)?;

        tracing::info!(
            vectors = self.vector_store.len(),
            keyword_documents = stats.documents,
            generation = stats.generation,
            "Indexed corpus"
        );
        Ok(stats)
    }

    /// Load a knowledge directory and index it
    pub async fn index_directory(&self, dir: &Path) -> Result<IndexStats, RagError> {
        let chunks = KnowledgeLoader::load_directory(dir)?;
        self.index(chunks).await
    }

    /// Write the vector store to its configured path; `false` when none is set
    ///
    /// The snapshot keeps `search_text`, so `from_settings` can rebuild the
    /// keyword index from it.
    pub fn persist(&self) -> Result<bool, RagError> {
        self.vector_store.save_default()
    }

    /// Run the retrieval pipeline with configured defaults
    pub async fn retrieve(&self, query: &str) -> Result<RetrievalOutcome, RagError> {
        self.retriever.retrieve(query).await
    }

    /// Retrieve, then build the prompt context from the results
    ///
    /// Parent blocks are used as context candidates when aggregation ran.
    pub async fn build_context(
        &self,
        query: &str,
        history: Option<&dyn ConversationContextProvider>,
    ) -> Result<EngineResponse, RagError> {
        let outcome = self.retrieve(query).await?;
        let intents = outcome.analysis.intent_kinds();

        let mut context = self
            .context_builder
            .build_context(query, &intents, outcome.context_candidates(), history)
            .await;

        // Retrieval-side degradations travel with the context metadata
        for stage in outcome.degraded.iter().rev() {
            if !context.metadata.degraded.contains(stage) {
                context.metadata.degraded.insert(0, *stage);
            }
        }

        Ok(EngineResponse { outcome, context })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use grounding_core::ChunkId;

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> grounding_core::Result<Vec<f32>> {
            let lower = text.to_lowercase();
            Ok(vec![
                if lower.contains("staking") { 1.0 } else { 0.1 },
                if lower.contains("bridge") { 1.0 } else { 0.1 },
                0.1,
            ])
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            Chunk::new(ChunkId::new("staking"), "Staking rewards are paid every epoch.")
                .with_search_text("staking rewards epoch"),
            Chunk::new(ChunkId::new("bridge"), "The bridge settles transfers in minutes.")
                .with_search_text("bridge transfers"),
        ]
    }

    #[test]
    fn test_dimension_must_match() {
        let mut settings = Settings::default();
        settings.vector.dimension = 8;
        let err = RagEngine::from_settings(&settings, Arc::new(AxisEmbedder)).err();
        assert!(matches!(err, Some(RagError::DimensionMismatch { expected: 8, actual: 3 })));
    }

    #[tokio::test]
    async fn test_index_and_build_context() {
        let engine = RagEngine::new(Arc::new(AxisEmbedder)).unwrap();
        let stats = engine.index(corpus()).await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(engine.vector_store().len(), 2);

        let response = engine.build_context("tell me about staking", None).await.unwrap();
        assert_eq!(response.outcome.results[0].id.as_str(), "staking");
        assert!(response.context.context.contains("Staking rewards are paid every epoch."));
        assert_eq!(response.context.prompt_sections.query, "tell me about staking");
    }

    #[tokio::test]
    async fn test_reindex_replaces_corpus() {
        let engine = RagEngine::new(Arc::new(AxisEmbedder)).unwrap();
        engine.index(corpus()).await.unwrap();

        let stats = engine
            .index(vec![Chunk::new(ChunkId::new("only"), "Bridge only.").with_search_text("bridge")])
            .await
            .unwrap();
        assert_eq!(stats.generation, 2);
        assert_eq!(engine.vector_store().len(), 1);
    }

    #[tokio::test]
    async fn test_persisted_corpus_restored_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.vector.dimension = 3;
        settings.vector.persist_path = Some(dir.path().join("vectors.json").display().to_string());

        let first = RagEngine::from_settings(&settings, Arc::new(AxisEmbedder)).unwrap();
        assert!(first.vector_store().is_empty());
        first.index(corpus()).await.unwrap();
        assert!(first.persist().unwrap());

        let second = RagEngine::from_settings(&settings, Arc::new(AxisEmbedder)).unwrap();
        assert_eq!(second.vector_store().len(), 2);
        assert_eq!(second.keyword_index().stats().unwrap().documents, 2);

        let outcome = second.retrieve("staking epoch").await.unwrap();
        assert_eq!(outcome.results[0].id.as_str(), "staking");
    }

    #[test]
    fn test_persisted_snapshot_with_other_dimension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let other = VectorStore::new(VectorStoreConfig {
            dimension: 2,
            persist_path: None,
        });
        other
            .add(&Chunk::new(ChunkId::new("x"), "x").with_embedding(vec![1.0, 0.0]))
            .unwrap();
        other.save(&path).unwrap();

        let mut settings = Settings::default();
        settings.vector.dimension = 3;
        settings.vector.persist_path = Some(path.display().to_string());
        let err = RagEngine::from_settings(&settings, Arc::new(AxisEmbedder)).err();
        assert!(matches!(err, Some(RagError::DimensionMismatch { expected: 3, actual: 2 })));
    }

    #[tokio::test]
    async fn test_unloadable_model_reported_on_every_retrieval() {
        let mut settings = Settings::default();
        settings.vector.dimension = 3;
        settings.reranker.model_path = Some("/nonexistent/cross-encoder.onnx".into());
        settings.reranker.tokenizer_path = Some("/nonexistent/tokenizer.json".into());

        let engine = RagEngine::from_settings(&settings, Arc::new(AxisEmbedder)).unwrap();
        engine.index(corpus()).await.unwrap();

        for _ in 0..2 {
            let outcome = engine.retrieve("staking").await.unwrap();
            assert!(outcome.degraded.contains(&crate::telemetry::DegradedStage::ModelLoad));
            assert_eq!(outcome.results[0].id.as_str(), "staking");
        }

        let healthy = RagEngine::new(Arc::new(AxisEmbedder)).unwrap();
        healthy.index(corpus()).await.unwrap();
        assert!(healthy.retrieve("staking").await.unwrap().degraded.is_empty());
    }

    #[tokio::test]
    async fn test_bad_vector_rejected_before_indexing() {
        let engine = RagEngine::new(Arc::new(AxisEmbedder)).unwrap();
        engine.index(corpus()).await.unwrap();

        let bad = Chunk::new(ChunkId::new("bad"), "x").with_embedding(vec![1.0]);
        assert!(engine.index(vec![bad]).await.is_err());
        assert_eq!(engine.vector_store().len(), 2);
    }
}
