//! End-to-end tests for retrieval and context building
//!
//! These run the full engine over a small corpus with deterministic mock
//! collaborators.

use std::sync::Arc;

use async_trait::async_trait;

use grounding_core::{
    Chunk, ChunkId, ChunkMetadata, ClusteringService, ConversationContextProvider,
    ConversationSnippet, DiversityReranker, Embedder, Error, IntentKind, RelevanceModel,
    RetrievalResult, RetrieveOptions, Retriever, SearchSource,
};
use grounding_rag::{DedupMode, DegradedStage, RagEngine};

/// Bag-of-topics embedding: one axis per topic word, plus a bias
struct TopicEmbedder;

const TOPICS: [&str; 4] = ["token", "staking", "bridge", "wallet"];

fn topic_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = TOPICS
        .iter()
        .map(|t| if lower.contains(t) { 1.0 } else { 0.0 })
        .collect();
    v.push(0.2);
    v
}

#[async_trait]
impl Embedder for TopicEmbedder {
    async fn embed(&self, text: &str) -> grounding_core::Result<Vec<f32>> {
        Ok(topic_vector(text))
    }

    fn dimension(&self) -> usize {
        TOPICS.len() + 1
    }
}

struct FailingModel;

#[async_trait]
impl RelevanceModel for FailingModel {
    async fn score_batch(&self, _query: &str, _passages: &[String]) -> grounding_core::Result<Vec<f32>> {
        Err(Error::Model("inference backend unavailable".into()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

struct FailingDiversity;

#[async_trait]
impl DiversityReranker for FailingDiversity {
    async fn select(
        &self,
        _query: &str,
        _results: Vec<RetrievalResult>,
        _target: usize,
    ) -> grounding_core::Result<Vec<RetrievalResult>> {
        Err(Error::Diversity("mmr failed".into()))
    }
}

struct FailingClusters;

#[async_trait]
impl ClusteringService for FailingClusters {
    async fn cluster(
        &self,
        _items: &[RetrievalResult],
        _threshold: f32,
    ) -> grounding_core::Result<Vec<Vec<ChunkId>>> {
        Err(Error::Clustering("embedding cache cold".into()))
    }
}

struct FailingHistory;

#[async_trait]
impl ConversationContextProvider for FailingHistory {
    async fn context_for(&self, _query: &str) -> grounding_core::Result<ConversationSnippet> {
        Err(Error::Context("session expired".into()))
    }
}

fn chunk(id: &str, text: &str, source: &str) -> Chunk {
    Chunk::new(ChunkId::new(id), text)
        .with_search_text(text)
        .with_metadata(ChunkMetadata::new().with_source(source).with_title(id))
}

/// Six chunks; only one mentions the literal ticker
fn ticker_corpus() -> Vec<Chunk> {
    vec![
        chunk(
            "zeta-overview",
            "ZETA is the native asset of the network. The $ZETA ticker is listed on major venues.",
            "docs/zeta",
        ),
        chunk("token-basics", "A token represents value on chain. Token standards vary.", "docs/tokens"),
        chunk("token-fees", "Token transfers pay a small fee to validators.", "docs/fees"),
        chunk("staking", "Staking locks assets to secure the network.", "docs/staking"),
        chunk("bridge", "The bridge moves assets between chains.", "docs/bridge"),
        chunk("wallet", "A wallet holds keys, never share your seed phrase.", "docs/wallet"),
    ]
}

async fn engine_with(corpus: Vec<Chunk>) -> RagEngine {
    let engine = RagEngine::new(Arc::new(TopicEmbedder)).unwrap();
    engine.index(corpus).await.unwrap();
    engine
}

#[tokio::test]
async fn test_ticker_query_ranks_literal_match_first() {
    let engine = engine_with(ticker_corpus()).await;

    let outcome = engine.retrieve("What is the $ZETA token?").await.unwrap();

    assert!(outcome.analysis.has_intent(IntentKind::TickerSymbol));
    assert!(outcome.analysis.needs_keyword_search);
    assert!(outcome.weights.keyword >= 0.75);
    assert!((outcome.weights.dense + outcome.weights.keyword - 1.0).abs() < 1e-6);

    let top = &outcome.results[0];
    assert_eq!(top.id.as_str(), "zeta-overview");
    assert_eq!(top.source, SearchSource::Hybrid);
    assert!(top.bm25_score.unwrap() > 0.0);
}

#[tokio::test]
async fn test_ticker_context_cites_source() {
    let engine = engine_with(ticker_corpus()).await;

    let response = engine.build_context("What is the $ZETA token?", None).await.unwrap();

    assert!(response.context.context.starts_with("[1] zeta-overview (docs/zeta)"));
    assert!(response.context.metadata.sources.contains(&"docs/zeta".to_string()));
    assert!(response.context.metadata.estimated_tokens > 0);
    assert!(response.context.metadata.degraded.is_empty());
}

#[tokio::test]
async fn test_degraded_collaborators_never_fail_the_request() {
    let engine = RagEngine::new(Arc::new(TopicEmbedder))
        .unwrap()
        .with_relevance_model(Arc::new(FailingModel))
        .with_diversity(Arc::new(FailingDiversity))
        .with_clustering(Arc::new(FailingClusters));
    engine.index(ticker_corpus()).await.unwrap();

    let response = engine
        .build_context("What is the $ZETA token?", Some(&FailingHistory))
        .await
        .unwrap();

    let degraded = &response.context.metadata.degraded;
    assert!(degraded.contains(&DegradedStage::ModelBatch));
    assert!(degraded.contains(&DegradedStage::Diversity));
    assert!(degraded.contains(&DegradedStage::Clustering));
    assert!(degraded.contains(&DegradedStage::ConversationContext));

    assert_eq!(response.context.metadata.dedup_mode, DedupMode::Hash);
    assert!(response.context.prompt_sections.conversation.is_empty());
    assert_eq!(response.outcome.results[0].id.as_str(), "zeta-overview");

    let stats = engine.retriever().reranker().unwrap().stats();
    assert!(stats.fallback_batches >= 1);
}

#[tokio::test]
async fn test_one_chunk_per_source_in_context() {
    let mut corpus: Vec<Chunk> = (0..5)
        .map(|i| {
            let text = format!("Staking guide section {} covers reward timing.", i);
            Chunk::new(ChunkId::new(format!("guide-{}", i)), text.clone())
                .with_search_text(text)
                .with_metadata(ChunkMetadata {
                    url: Some("https://docs.example/staking".into()),
                    ..Default::default()
                })
        })
        .collect();
    corpus.extend((0..2).map(|i| {
        let text = format!("Staking FAQ answer {} about unbonding.", i);
        Chunk::new(ChunkId::new(format!("faq-{}", i)), text.clone())
            .with_search_text(text)
            .with_metadata(ChunkMetadata {
                url: Some("https://docs.example/faq".into()),
                ..Default::default()
            })
    }));

    let engine = engine_with(corpus).await;
    let response = engine.build_context("staking rewards", None).await.unwrap();

    // Fusion keys by chunk id here, so all seven candidates reach the builder
    assert_eq!(response.outcome.results.len(), 7);
    assert_eq!(response.context.metadata.chunks_used, 2);
    assert_eq!(response.context.metadata.sources.len(), 2);
    assert!(response
        .context
        .metadata
        .sources
        .iter()
        .all(|s| s.starts_with("url:")));
}

#[tokio::test]
async fn test_aggregated_retrieval_through_trait() {
    let parent = |name: &str, part: u32, text: &str| {
        Chunk::new(ChunkId::new(format!("{}#p{}", name, part)), text)
            .with_search_text(text)
            .with_metadata(ChunkMetadata::new().with_parent(ChunkId::new(name), Some(part)))
    };
    let corpus = vec![
        parent("staking-guide", 1, "Staking basics: lock tokens to earn rewards."),
        parent("staking-guide", 2, "Staking rewards arrive every epoch."),
        parent("bridge-guide", 1, "The bridge locks tokens on the source chain."),
        parent("wallet-guide", 1, "Wallet setup: write down the seed phrase."),
    ];
    let engine = engine_with(corpus).await;

    let options = RetrieveOptions::default().with_top_k(10).aggregated();
    let results = Retriever::retrieve(engine.retriever(), "staking token rewards", &options)
        .await
        .unwrap();

    assert!(results.iter().all(|r| r.source == SearchSource::Aggregated));
    let staking = results
        .iter()
        .find(|r| r.id.as_str() == "staking-guide")
        .unwrap();
    assert_eq!(staking.metadata.extra.get("child_count"), Some(&serde_json::json!(2)));
    assert_eq!(results[0].id.as_str(), "staking-guide");
}

/// Forty chunks that all mention a token; only the first names the ticker
fn tagged_corpus(tag: &str) -> Vec<Chunk> {
    (0..40)
        .map(|i| {
            let text = if i == 0 {
                format!("The $ZETA token overview for the {} release.", tag)
            } else {
                format!("Token note {} for the {} release.", i, tag)
            };
            chunk(&format!("{}-{}", tag, i), &text, &format!("docs/{}/{}", tag, i))
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reindex_never_exposes_empty_or_mixed_corpus() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let engine = Arc::new(engine_with(tagged_corpus("alpha")).await);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut rounds = 0usize;
                loop {
                    let outcome = engine.retrieve("What is the $ZETA token?").await.unwrap();
                    assert!(!outcome.results.is_empty());
                    let tag = outcome.results[0].id.as_str().split('-').next().unwrap().to_string();
                    assert!(
                        outcome
                            .results
                            .iter()
                            .all(|r| r.id.as_str().starts_with(&format!("{}-", tag))),
                        "results mix corpora: {:?}",
                        outcome.results.iter().map(|r| r.id.to_string()).collect::<Vec<_>>()
                    );
                    rounds += 1;
                    if done.load(Ordering::Relaxed) {
                        return rounds;
                    }
                }
            })
        })
        .collect();

    for round in 0..30 {
        let tag = if round % 2 == 0 { "beta" } else { "alpha" };
        engine.index(tagged_corpus(tag)).await.unwrap();
        tokio::task::yield_now().await;
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
}
