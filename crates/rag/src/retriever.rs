//! Hybrid knowledge retriever.
//!
//! Pipeline per search: normalize -> classify intent (adjusts the
//! similarity threshold) -> expand (Indic-mixed paraphrases, issued in
//! parallel, merged by max score per chunk) -> cache check -> dense +
//! sparse fusion by reciprocal rank -> threshold cut.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callbridge_config::constants::rag;
use callbridge_core::LruTtlCache;

use crate::embeddings::Embedder;
use crate::query_expansion::QueryExpander;
use crate::sparse::{SparseDoc, SparseIndex};
use crate::vector_store::{VectorHit, VectorStore};
use crate::RagError;

/// Dense search seam (implemented by [`VectorStore`], stubbed in tests).
#[async_trait]
pub trait DenseSearcher: Send + Sync {
    async fn search_namespace(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, RagError>;
}

#[async_trait]
impl DenseSearcher for VectorStore {
    async fn search_namespace(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, RagError> {
        self.search(namespace, vector, top_k).await
    }
}

/// Retriever tuning.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub top_k: usize,
    pub base_min_score: f32,
    pub rrf_k: f32,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub expansion_enabled: bool,
    /// Candidates fetched per source before fusion.
    pub fetch_k: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: rag::DEFAULT_TOP_K,
            base_min_score: rag::BASE_MIN_SCORE,
            rrf_k: rag::RRF_K,
            cache_capacity: rag::CACHE_CAPACITY,
            cache_ttl: Duration::from_secs(rag::CACHE_TTL_SECS),
            expansion_enabled: true,
            fetch_k: 20,
        }
    }
}

/// Per-search overrides.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
}

/// One retrieved chunk.
#[derive(Debug, Clone, Serialize)]
pub struct SearchItem {
    pub chunk_id: String,
    pub text: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// Search result with cache provenance.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub items: Vec<SearchItem>,
    pub cached: bool,
    /// Threshold actually applied after intent adjustment.
    pub adjusted_threshold: f32,
}

/// Hybrid retriever over per-agent namespaces.
pub struct KnowledgeRetriever {
    dense: Arc<dyn DenseSearcher>,
    embedder: Arc<dyn Embedder>,
    sparse: DashMap<String, Arc<SparseIndex>>,
    expander: QueryExpander,
    cache: LruTtlCache<String, Vec<SearchItem>>,
    config: RetrieverConfig,
}

impl KnowledgeRetriever {
    pub fn new(
        dense: Arc<dyn DenseSearcher>,
        embedder: Arc<dyn Embedder>,
        config: RetrieverConfig,
    ) -> Self {
        let cache = LruTtlCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            dense,
            embedder,
            sparse: DashMap::new(),
            expander: QueryExpander::default(),
            cache,
            config,
        }
    }

    pub fn with_expander(mut self, expander: QueryExpander) -> Self {
        self.expander = expander;
        self
    }

    /// Feed chunks into the namespace's sparse index.
    pub fn index_sparse(
        &self,
        namespace: &str,
        language: &str,
        docs: &[SparseDoc],
    ) -> Result<(), RagError> {
        let index = match self.sparse.get(namespace) {
            Some(index) => index.clone(),
            None => {
                let index = Arc::new(SparseIndex::new(language)?);
                self.sparse.insert(namespace.to_string(), index.clone());
                index
            }
        };
        index.index_documents(docs)
    }

    /// Remove chunks from the namespace's sparse index.
    pub fn remove_sparse(&self, namespace: &str, chunk_ids: &[String]) -> Result<(), RagError> {
        if let Some(index) = self.sparse.get(namespace) {
            index.delete(chunk_ids)?;
        }
        Ok(())
    }

    /// Search a namespace.
    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResponse, RagError> {
        let normalized = QueryExpander::normalize(query);
        let intent = QueryExpander::classify(&normalized);
        let base = options.min_score.unwrap_or(self.config.base_min_score);
        let adjusted_threshold = (base + intent.threshold_shift()).clamp(0.0, 1.0);
        let top_k = options.top_k.unwrap_or(self.config.top_k);

        let cache_key = format!("{namespace}|{normalized}|{top_k}");
        if let Some(items) = self.cache.get(&cache_key) {
            metrics::counter!("callbridge_rag_cache_hits").increment(1);
            return Ok(SearchResponse {
                items,
                cached: true,
                adjusted_threshold,
            });
        }

        // Base query plus expansions, embedded in one batch.
        let mut queries = vec![normalized.clone()];
        if self.config.expansion_enabled {
            queries.extend(self.expander.expand(&normalized));
        }
        let embeddings = self.embedder.embed(&queries).await?;

        // Parallel dense searches; failures of individual expansions are
        // tolerated as long as the base query succeeds.
        let searches = embeddings.iter().map(|vector| {
            self.dense
                .search_namespace(namespace, vector, self.config.fetch_k)
        });
        let results = join_all(searches).await;

        let mut dense_best: HashMap<String, VectorHit> = HashMap::new();
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(hits) => {
                    for hit in hits {
                        match dense_best.get(&hit.chunk_id) {
                            Some(existing) if existing.score >= hit.score => {}
                            _ => {
                                dense_best.insert(hit.chunk_id.clone(), hit);
                            }
                        }
                    }
                }
                Err(e) if i == 0 => return Err(e),
                Err(e) => {
                    tracing::debug!(error = %e, expansion = %queries[i], "Expansion search failed");
                }
            }
        }

        // Sparse side for the base query.
        let sparse_hits = match self.sparse.get(namespace) {
            Some(index) => index.search(&normalized, self.config.fetch_k)?,
            None => Vec::new(),
        };

        let items = self.fuse(dense_best, sparse_hits, adjusted_threshold, top_k);
        self.cache.insert(cache_key, items.clone());

        Ok(SearchResponse {
            items,
            cached: false,
            adjusted_threshold,
        })
    }

    /// Reciprocal-rank fusion of the dense and sparse rankings.
    ///
    /// The reported score is the stronger of the dense similarity and the
    /// normalized BM25 score, so the threshold stays in similarity space.
    fn fuse(
        &self,
        dense_best: HashMap<String, VectorHit>,
        sparse_hits: Vec<crate::sparse::SparseHit>,
        threshold: f32,
        top_k: usize,
    ) -> Vec<SearchItem> {
        let mut dense_ranked: Vec<&VectorHit> = dense_best.values().collect();
        dense_ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let max_sparse = sparse_hits
            .iter()
            .map(|h| h.score)
            .fold(f32::EPSILON, f32::max);

        struct Fused {
            text: String,
            metadata: HashMap<String, String>,
            rrf: f32,
            score: f32,
        }
        let mut fused: HashMap<String, Fused> = HashMap::new();

        for (rank, hit) in dense_ranked.iter().enumerate() {
            fused.insert(
                hit.chunk_id.clone(),
                Fused {
                    text: hit.text.clone(),
                    metadata: hit.metadata.clone(),
                    rrf: 1.0 / (self.config.rrf_k + rank as f32 + 1.0),
                    score: hit.score,
                },
            );
        }

        for (rank, hit) in sparse_hits.iter().enumerate() {
            let normalized_score = hit.score / max_sparse;
            let rrf = 1.0 / (self.config.rrf_k + rank as f32 + 1.0);
            fused
                .entry(hit.chunk_id.clone())
                .and_modify(|f| {
                    f.rrf += rrf;
                    f.score = f.score.max(normalized_score);
                })
                .or_insert_with(|| Fused {
                    text: hit.text.clone(),
                    metadata: hit.metadata.clone(),
                    rrf,
                    score: normalized_score,
                });
        }

        let mut items: Vec<(f32, SearchItem)> = fused
            .into_iter()
            .filter(|(_, f)| f.score >= threshold)
            .map(|(chunk_id, f)| {
                (
                    f.rrf,
                    SearchItem {
                        chunk_id,
                        text: f.text,
                        score: f.score,
                        metadata: f.metadata,
                    },
                )
            })
            .collect();
        items.sort_by(|a, b| b.0.total_cmp(&a.0));
        items.into_iter().take(top_k).map(|(_, item)| item).collect()
    }

    /// Establish caches and index residency for a namespace.
    pub async fn warmup_namespace(&self, namespace: &str) -> Result<(), RagError> {
        let embeddings = self.embedder.embed(&["warmup".to_string()]).await?;
        if let Some(vector) = embeddings.first() {
            let _ = self.dense.search_namespace(namespace, vector, 1).await?;
        }
        tracing::debug!(namespace, "Namespace warmed");
        Ok(())
    }

    /// Drop every cached result.
    pub fn invalidate_all_caches(&self) {
        self.cache.clear();
    }

    /// Reclaim expired cache entries; run periodically.
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cache_stats(&self) -> callbridge_core::CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::HashEmbedder;

    struct StubDense {
        hits: Vec<VectorHit>,
    }

    #[async_trait]
    impl DenseSearcher for StubDense {
        async fn search_namespace(
            &self,
            _namespace: &str,
            _vector: &[f32],
            _top_k: usize,
        ) -> Result<Vec<VectorHit>, RagError> {
            Ok(self.hits.clone())
        }
    }

    fn hit(id: &str, score: f32, text: &str) -> VectorHit {
        VectorHit {
            chunk_id: id.to_string(),
            score,
            text: text.to_string(),
            metadata: HashMap::new(),
        }
    }

    fn retriever(hits: Vec<VectorHit>) -> KnowledgeRetriever {
        KnowledgeRetriever::new(
            Arc::new(StubDense { hits }),
            Arc::new(HashEmbedder { dimension: 32 }),
            RetrieverConfig::default(),
        )
    }

    #[tokio::test]
    async fn second_identical_search_hits_cache() {
        let retriever = retriever(vec![hit("c1", 0.9, "rates start at nine percent")]);

        let first = retriever
            .search("agent-1", "what is the rate", SearchOptions::default())
            .await
            .unwrap();
        assert!(!first.cached);
        assert_eq!(first.items.len(), 1);

        let second = retriever
            .search("agent-1", "what is the rate", SearchOptions::default())
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.items[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn invalidation_clears_cache() {
        let retriever = retriever(vec![hit("c1", 0.9, "text")]);
        let _ = retriever
            .search("agent-1", "query one", SearchOptions::default())
            .await
            .unwrap();
        retriever.invalidate_all_caches();
        let response = retriever
            .search("agent-1", "query one", SearchOptions::default())
            .await
            .unwrap();
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn threshold_filters_weak_hits() {
        let retriever = retriever(vec![
            hit("strong", 0.9, "strong match"),
            hit("weak", 0.1, "weak match"),
        ]);
        // "hello there" classifies generic: base threshold 0.35 applies.
        let response = retriever
            .search("agent-1", "hello there", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].chunk_id, "strong");
    }

    #[tokio::test]
    async fn factual_intent_raises_threshold() {
        let retriever = retriever(vec![hit("mid", 0.40, "borderline")]);
        // Factual: 0.35 + 0.1 = 0.45 > 0.40 -> filtered.
        let response = retriever
            .search("agent-1", "what is the fee", SearchOptions::default())
            .await
            .unwrap();
        assert!(response.items.is_empty());
        assert!((response.adjusted_threshold - 0.45).abs() < 1e-6);

        // Exploratory: 0.35 - 0.1 = 0.25 < 0.40 -> kept.
        let response = retriever
            .search("agent-1", "tell me about the plan", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.items.len(), 1);
    }

    #[tokio::test]
    async fn sparse_only_hits_can_surface() {
        let retriever = retriever(Vec::new());
        retriever
            .index_sparse(
                "agent-1",
                "en",
                &[SparseDoc {
                    chunk_id: "s1".into(),
                    text: "processing fee is one percent".into(),
                    section_title: None,
                }],
            )
            .unwrap();

        let response = retriever
            .search("agent-1", "processing fee", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.items.len(), 1);
        assert_eq!(response.items[0].chunk_id, "s1");
        // Top sparse hit normalizes to 1.0.
        assert!(response.items[0].score >= 0.99);
    }

    #[tokio::test]
    async fn top_k_bounds_results() {
        let hits: Vec<VectorHit> = (0..20)
            .map(|i| hit(&format!("c{i}"), 0.9 - i as f32 * 0.01, "text"))
            .collect();
        let retriever = retriever(hits);
        let response = retriever
            .search(
                "agent-1",
                "hello there",
                SearchOptions {
                    top_k: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(response.items.len(), 3);
        assert_eq!(response.items[0].chunk_id, "c0");
    }
}
