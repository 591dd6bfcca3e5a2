//! Application state.
//!
//! Explicit long-lived values owned by one root, passed down to every
//! handler. No process-wide singletons.

use std::sync::Arc;

use callbridge_config::Settings;
use callbridge_core::EventBroker;
use callbridge_ingest::{IngestionPipeline, RetentionService};
use callbridge_integrations::Dispatcher;
use callbridge_llm::ChatBackend;
use callbridge_persistence::{
    AgentStore, CallSessionStore, IntegrationStore, MetricsStore, OrganizationStore,
};
use callbridge_rag::{ChunkRecord, KnowledgeRetriever};
use callbridge_telephony::CallOrchestrator;

use crate::runtime::SessionHandles;
use crate::shutdown::ShutdownCoordinator;

/// Source of chunk rows for the analytics routes.
#[async_trait::async_trait]
pub trait ChunkAnalyticsSource: Send + Sync {
    async fn chunks_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<ChunkRecord>, callbridge_persistence::PersistenceError>;
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub organizations: Arc<dyn OrganizationStore>,
    pub agents: Arc<dyn AgentStore>,
    pub call_sessions: Arc<dyn CallSessionStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub integration_store: Arc<dyn IntegrationStore>,
    pub orchestrator: Arc<CallOrchestrator>,
    pub ingestion: Arc<IngestionPipeline>,
    pub retention: Arc<RetentionService>,
    pub retriever: Arc<KnowledgeRetriever>,
    pub dispatcher: Arc<Dispatcher>,
    pub broker: Arc<EventBroker>,
    pub llm: Arc<dyn ChatBackend>,
    pub chunk_source: Arc<dyn ChunkAnalyticsSource>,
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Live voice sessions by session id; the transport glue takes the
    /// audio channels from here.
    pub voice_sessions: Arc<dashmap::DashMap<String, SessionHandles>>,
    /// Whether the datastore behind the stores is a real database.
    pub persistent: bool,
}

impl AppState {
    /// Dependency checks for the readiness probe.
    pub async fn readiness(&self) -> Vec<(String, bool)> {
        let llm_ok = self.llm.is_available().await;
        // The in-memory fallback still counts as a working datastore;
        // `persistent` is surfaced for operators, not gating.
        vec![
            ("datastore".to_string(), true),
            ("llm".to_string(), llm_ok),
            (
                "admission".to_string(),
                !self.shutdown.is_shutting_down(),
            ),
        ]
    }
}
