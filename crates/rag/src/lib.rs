//! Knowledge retrieval over per-agent namespaces.
//!
//! Dense vectors live in one Qdrant collection partitioned by a
//! `namespace` payload field (the agent id); a per-namespace tantivy BM25
//! index supplies the sparse side of hybrid search. Queries are
//! normalized, intent-classified, expanded, cached and fused.

pub mod analytics;
mod embeddings;
mod query_expansion;
mod retriever;
mod sparse;
mod vector_store;

pub use analytics::{ChunkRecord, ChunksAnalytics, ContentTypeDistribution, QualityBuckets};
pub use embeddings::{EmbeddingClient, EmbeddingClientConfig, Embedder};
pub use query_expansion::{QueryExpander, QueryIntent};
pub use retriever::{
    DenseSearcher, KnowledgeRetriever, RetrieverConfig, SearchItem, SearchOptions,
    SearchResponse,
};
pub use sparse::{SparseDoc, SparseHit, SparseIndex};
pub use vector_store::{ChunkPayload, ChunkPoint, ChunkStatus, VectorHit, VectorStore, VectorStoreConfig};

use thiserror::Error;

/// Retrieval errors.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("sparse index error: {0}")]
    Index(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("search error: {0}")]
    Search(String),
}
