//! Datastore layer.
//!
//! Typed stores over ScyllaDB, one module per aggregate, plus in-memory
//! implementations used in development mode and by the server tests.
//! Store traits are the seam; handlers never see CQL.

mod agents;
mod client;
mod documents;
mod integrations;
pub mod memory;
mod metrics_store;
mod organizations;
mod schema;
mod sessions;

pub use agents::{AgentRecord, AgentStatus, AgentStore, PhoneAssignment, ScyllaAgentStore};
pub use client::{ScyllaClient, ScyllaConfig};
pub use documents::ScyllaIngestStore;
pub use integrations::{IntegrationStore, ScyllaIntegrationStore};
pub use metrics_store::{
    CallMetricRecord, MetricAggregate, MetricType, MetricsStore, ScyllaMetricsStore,
};
pub use organizations::{
    Organization, OrganizationStatus, OrganizationStore, ScyllaOrganizationStore,
};
pub use sessions::{
    CallSessionRecord, CallSessionStore, ScyllaCallSessionStore, SessionStatus,
};

use thiserror::Error;

/// Persistence errors.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<scylla::transport::errors::QueryError> for PersistenceError {
    fn from(e: scylla::transport::errors::QueryError) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<scylla::transport::errors::NewSessionError> for PersistenceError {
    fn from(e: scylla::transport::errors::NewSessionError) -> Self {
        Self::Database(e.to_string())
    }
}

/// All Scylla-backed stores, connected and schema-ensured.
pub struct PersistenceLayer {
    pub organizations: ScyllaOrganizationStore,
    pub agents: ScyllaAgentStore,
    pub sessions: ScyllaCallSessionStore,
    pub metrics: ScyllaMetricsStore,
    pub documents: ScyllaIngestStore,
    pub integrations: ScyllaIntegrationStore,
}

/// Connect and bootstrap the schema.
pub async fn init(config: ScyllaConfig) -> Result<PersistenceLayer, PersistenceError> {
    let client = ScyllaClient::connect(config).await?;
    client.ensure_schema().await?;
    Ok(PersistenceLayer {
        organizations: ScyllaOrganizationStore::new(client.clone()),
        agents: ScyllaAgentStore::new(client.clone()),
        sessions: ScyllaCallSessionStore::new(client.clone()),
        metrics: ScyllaMetricsStore::new(client.clone()),
        documents: ScyllaIngestStore::new(client.clone()),
        integrations: ScyllaIntegrationStore::new(client),
    })
}
