//! Qdrant-backed vector store.
//!
//! One collection for all agents; every point carries a `namespace`
//! payload equal to the owning agent id, and a `status` used to filter
//! soft-deleted documents out of retrieval without dropping their
//! vectors.

use qdrant_client::{
    qdrant::{
        value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
        PointId, PointStruct, PointsIdsList, SearchPointsBuilder, SetPayloadPointsBuilder,
        UpsertPointsBuilder, VectorParamsBuilder,
    },
    Payload, Qdrant,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::RagError;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub endpoint: String,
    pub collection: String,
    pub vector_dim: usize,
    pub api_key: Option<String>,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: callbridge_config::constants::endpoints::QDRANT_DEFAULT.to_string(),
            collection: "knowledge".to_string(),
            vector_dim: 384,
            api_key: None,
        }
    }
}

/// Whether a chunk participates in retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Live,
    Deleted,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Deleted => "deleted",
        }
    }
}

/// Payload stored with each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub namespace: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub content_type: String,
    pub quality: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
}

/// A point ready for upsert.
#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// One search hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

/// Vector store client.
pub struct VectorStore {
    client: Qdrant,
    config: VectorStoreConfig,
}

impl VectorStore {
    pub async fn new(config: VectorStoreConfig) -> Result<Self, RagError> {
        let mut builder = Qdrant::from_url(&config.endpoint);
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Create the collection if missing.
    pub async fn ensure_collection(&self) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                        VectorParamsBuilder::new(
                            self.config.vector_dim as u64,
                            Distance::Cosine,
                        ),
                    ),
                )
                .await
                .map_err(|e| RagError::VectorStore(e.to_string()))?;
            tracing::info!(collection = %self.config.collection, "Created vector collection");
        }
        Ok(())
    }

    /// Insert or update chunk points.
    pub async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<(), RagError> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                payload.insert("namespace".into(), point.payload.namespace.into());
                payload.insert("document_id".into(), point.payload.document_id.into());
                payload.insert(
                    "chunk_index".into(),
                    (point.payload.chunk_index as i64).into(),
                );
                payload.insert("text".into(), point.payload.text.into());
                payload.insert("content_type".into(), point.payload.content_type.into());
                payload.insert("quality".into(), (point.payload.quality as f64).into());
                payload.insert("status".into(), ChunkStatus::Live.as_str().into());
                if let Some(section) = point.payload.section_title {
                    payload.insert("section_title".into(), section.into());
                }
                PointStruct::new(point.id, point.vector, Payload::from(payload))
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.config.collection, points))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(())
    }

    /// Search within one namespace, excluding soft-deleted chunks.
    pub async fn search(
        &self,
        namespace: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, RagError> {
        let filter = Filter::must([
            Condition::matches("namespace", namespace.to_string()),
            Condition::matches("status", ChunkStatus::Live.as_str().to_string()),
        ]);

        let request = SearchPointsBuilder::new(
            &self.config.collection,
            query_vector.to_vec(),
            top_k as u64,
        )
        .filter(filter)
        .with_payload(true);

        let results = self
            .client
            .search_points(request)
            .await
            .map_err(|e| RagError::Search(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| {
                let mut metadata = HashMap::new();
                let mut text = String::new();
                for (key, value) in point.payload {
                    match value.kind {
                        Some(Kind::StringValue(s)) => {
                            if key == "text" {
                                text = s;
                            } else {
                                metadata.insert(key, s);
                            }
                        }
                        Some(Kind::IntegerValue(i)) => {
                            metadata.insert(key, i.to_string());
                        }
                        Some(Kind::DoubleValue(d)) => {
                            metadata.insert(key, d.to_string());
                        }
                        _ => {}
                    }
                }
                let chunk_id = point
                    .id
                    .map(|pid| match pid.point_id_options {
                        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) => u,
                        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(n)) => {
                            n.to_string()
                        }
                        None => String::new(),
                    })
                    .unwrap_or_default();
                VectorHit {
                    chunk_id,
                    score: point.score,
                    text,
                    metadata,
                }
            })
            .collect())
    }

    /// Flip the retrieval status of a document's chunks (soft delete /
    /// recover).
    pub async fn set_document_status(
        &self,
        namespace: &str,
        document_id: &str,
        status: ChunkStatus,
    ) -> Result<(), RagError> {
        let filter = Filter::must([
            Condition::matches("namespace", namespace.to_string()),
            Condition::matches("document_id", document_id.to_string()),
        ]);
        let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
        payload.insert("status".into(), status.as_str().into());

        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.config.collection, Payload::from(payload))
                    .points_selector(filter),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(())
    }

    /// Remove points permanently.
    pub async fn delete(&self, ids: &[String]) -> Result<(), RagError> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<PointId> = ids.iter().map(|id| PointId::from(id.clone())).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.config.collection)
                    .points(PointsIdsList { ids: points }),
            )
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = VectorStoreConfig::default();
        assert_eq!(config.vector_dim, 384);
        assert_eq!(config.collection, "knowledge");
    }

    #[test]
    fn status_strings() {
        assert_eq!(ChunkStatus::Live.as_str(), "live");
        assert_eq!(ChunkStatus::Deleted.as_str(), "deleted");
    }
}
