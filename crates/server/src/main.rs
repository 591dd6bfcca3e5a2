//! Callbridge server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use callbridge_config::{load_settings, Settings};
use callbridge_core::EventBroker;
use callbridge_ingest::{
    ChunkerConfig, DocumentChunker, DocumentParser, IngestStore, IngestionPipeline,
    ParseServiceConfig, PipelineOptions, RetentionService, VectorSink,
};
use callbridge_integrations::{Dispatcher, DispatcherConfig, WebhookPlugin};
use callbridge_llm::{OpenAiBackend, OpenAiConfig};
use callbridge_persistence::memory::{
    MemoryAgentStore, MemoryCallSessionStore, MemoryIngestStore, MemoryIntegrationStore,
    MemoryMetricsStore, MemoryOrganizationStore,
};
use callbridge_rag::{
    EmbeddingClient, EmbeddingClientConfig, KnowledgeRetriever, RetrieverConfig, VectorStore,
    VectorStoreConfig,
};
use callbridge_telephony::{CallOrchestrator, HttpSipControlPlane};

use callbridge_server::{
    adapters::{NullDenseSearcher, RagVectorSink, SparseOnlyVectorSink},
    create_router, init_metrics,
    shutdown::shutdown_signal,
    state::{AppState, ChunkAnalyticsSource},
    ShutdownCoordinator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Priority: env vars > config/{env}.yaml > config/default.yaml.
    let env = std::env::var("CALLBRIDGE_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        }
    };

    init_tracing(&config);
    tracing::info!("Starting callbridge v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(environment = ?config.environment, "Configuration loaded");

    let metrics_handle = init_metrics();
    tracing::info!("Prometheus metrics at /metrics");

    let broker = Arc::new(EventBroker::default());
    let shutdown = Arc::new(ShutdownCoordinator::new());

    // LLM backend (shared).
    let llm = Arc::new(OpenAiBackend::new(OpenAiConfig {
        endpoint: config.llm.endpoint.clone(),
        api_key: config.llm.api_key.clone(),
        model: config.llm.model.clone(),
        timeout: std::time::Duration::from_secs(config.llm.timeout_secs),
        ..Default::default()
    }));

    // Retrieval stack: Qdrant when reachable, sparse-only otherwise.
    let embedder = Arc::new(EmbeddingClient::new(EmbeddingClientConfig {
        endpoint: config.embedding.endpoint.clone(),
        model: config.embedding.model.clone(),
        dimension: config.embedding.vector_dim,
        ..Default::default()
    }));
    let retriever_config = RetrieverConfig {
        top_k: config.rag.top_k,
        base_min_score: config.rag.min_score,
        cache_ttl: std::time::Duration::from_secs(config.rag.cache_ttl_secs),
        expansion_enabled: config.rag.query_expansion_enabled,
        ..Default::default()
    };
    let (retriever, vector_sink): (Arc<KnowledgeRetriever>, Arc<dyn VectorSink>) =
        match init_vector_store(&config).await {
            Ok(vectors) => {
                let vectors = Arc::new(vectors);
                let retriever = Arc::new(KnowledgeRetriever::new(
                    vectors.clone(),
                    embedder.clone(),
                    retriever_config,
                ));
                let sink = Arc::new(RagVectorSink {
                    embedder: embedder.clone(),
                    vectors,
                    retriever: retriever.clone(),
                });
                (retriever, sink)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Vector store unavailable; retrieval is sparse-only");
                let retriever = Arc::new(KnowledgeRetriever::new(
                    Arc::new(NullDenseSearcher),
                    embedder.clone(),
                    retriever_config,
                ));
                let sink = Arc::new(SparseOnlyVectorSink {
                    retriever: retriever.clone(),
                });
                (retriever, sink)
            }
        };

    // Stores: ScyllaDB with an in-memory fallback for development.
    let memory_ingest = Arc::new(MemoryIngestStore::default());
    let (state_stores, ingest_store, chunk_source, persistent) =
        match callbridge_persistence::init(callbridge_persistence::ScyllaConfig {
            hosts: config.persistence.scylla_hosts.clone(),
            keyspace: config.persistence.keyspace.clone(),
            replication_factor: config.persistence.replication_factor,
        })
        .await
        {
            Ok(layer) => {
                tracing::info!(
                    hosts = ?config.persistence.scylla_hosts,
                    keyspace = %config.persistence.keyspace,
                    "ScyllaDB persistence initialized"
                );
                let documents = Arc::new(layer.documents);
                let stores = Stores {
                    organizations: Arc::new(layer.organizations),
                    agents: Arc::new(layer.agents),
                    sessions: Arc::new(layer.sessions),
                    metrics: Arc::new(layer.metrics),
                    integrations: Arc::new(layer.integrations),
                };
                let chunk_source: Arc<dyn ChunkAnalyticsSource> =
                    Arc::new(ScyllaChunkSource(documents.clone()));
                (stores, documents as Arc<dyn IngestStore>, chunk_source, true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "ScyllaDB unavailable; using in-memory stores");
                let stores = Stores {
                    organizations: Arc::new(MemoryOrganizationStore::default()),
                    agents: Arc::new(MemoryAgentStore::default()),
                    sessions: Arc::new(MemoryCallSessionStore::default()),
                    metrics: Arc::new(MemoryMetricsStore::default()),
                    integrations: Arc::new(MemoryIntegrationStore::default()),
                };
                let chunk_source: Arc<dyn ChunkAnalyticsSource> =
                    Arc::new(MemoryChunkSource(memory_ingest.clone()));
                (
                    stores,
                    memory_ingest.clone() as Arc<dyn IngestStore>,
                    chunk_source,
                    false,
                )
            }
        };

    // Ingestion pipeline and retention crons.
    let parser = Arc::new(DocumentParser::new(ParseServiceConfig {
        endpoint: config.ingestion.parse_endpoint.clone(),
        ..Default::default()
    }));
    let ingestion = IngestionPipeline::new(
        parser,
        Arc::new(DocumentChunker::new(ChunkerConfig::default())),
        ingest_store.clone(),
        vector_sink.clone(),
        PipelineOptions {
            max_file_bytes: config.ingestion.max_file_bytes,
            preview_enabled: config.ingestion.preview_enabled,
            ..Default::default()
        },
    );
    let retention = Arc::new(RetentionService::new(
        ingest_store,
        vector_sink,
        ingestion.clone(),
    ));
    retention.clone().start_crons();

    // Call orchestration.
    let control_plane = Arc::new(HttpSipControlPlane::new(
        config.livekit.url.clone(),
        config.livekit.api_key.clone(),
        config.livekit.api_secret.clone(),
    ));
    let orchestrator = CallOrchestrator::new(
        control_plane,
        broker.clone(),
        callbridge_telephony::OrchestratorConfig {
            max_concurrent_calls: config.telephony.max_concurrent_calls,
            ring_timeout: std::time::Duration::from_secs(config.telephony.ring_timeout_secs),
            max_call_duration: std::time::Duration::from_secs(
                config.telephony.max_call_duration_secs,
            ),
            sip_trunk_id: config.livekit.sip_trunk_id.clone(),
            latency_targets: Default::default(),
        },
    );

    let dispatcher = Arc::new(
        Dispatcher::new(DispatcherConfig::default()).register(Arc::new(WebhookPlugin::new())),
    );

    // Periodic sweep of expired cache entries.
    {
        let retriever = retriever.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let purged = retriever.purge_expired_cache();
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired retrieval cache entries");
                }
            }
        });
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        organizations: state_stores.organizations,
        agents: state_stores.agents,
        call_sessions: state_stores.sessions,
        metrics: state_stores.metrics,
        integration_store: state_stores.integrations,
        orchestrator: orchestrator.clone(),
        ingestion,
        retention,
        retriever,
        dispatcher,
        broker,
        llm,
        chunk_source,
        shutdown: shutdown.clone(),
        voice_sessions: Arc::new(dashmap::DashMap::new()),
        persistent,
    };

    let app = create_router(state, metrics_handle);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Stop admission and drain sessions before the listener
            // closes; bounded by the hard cap.
            shutdown.drain(&orchestrator).await;
        })
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

struct Stores {
    organizations: Arc<dyn callbridge_persistence::OrganizationStore>,
    agents: Arc<dyn callbridge_persistence::AgentStore>,
    sessions: Arc<dyn callbridge_persistence::CallSessionStore>,
    metrics: Arc<dyn callbridge_persistence::MetricsStore>,
    integrations: Arc<dyn callbridge_persistence::IntegrationStore>,
}

struct ScyllaChunkSource(Arc<callbridge_persistence::ScyllaIngestStore>);

#[async_trait::async_trait]
impl ChunkAnalyticsSource for ScyllaChunkSource {
    async fn chunks_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<callbridge_rag::ChunkRecord>, callbridge_persistence::PersistenceError> {
        self.0.chunks_for_agent(agent_id).await
    }
}

struct MemoryChunkSource(Arc<MemoryIngestStore>);

#[async_trait::async_trait]
impl ChunkAnalyticsSource for MemoryChunkSource {
    async fn chunks_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<callbridge_rag::ChunkRecord>, callbridge_persistence::PersistenceError> {
        Ok(self.0.chunks_for_agent(agent_id))
    }
}

/// Connect to Qdrant and ensure the collection.
async fn init_vector_store(config: &Settings) -> Result<VectorStore, callbridge_rag::RagError> {
    let store = VectorStore::new(VectorStoreConfig {
        endpoint: config.rag.qdrant_endpoint.clone(),
        collection: config.rag.collection.clone(),
        vector_dim: config.embedding.vector_dim,
        api_key: config.rag.qdrant_api_key.clone(),
    })
    .await?;
    store.ensure_collection().await?;
    Ok(store)
}

/// Initialize tracing (with optional OpenTelemetry when the feature is
/// enabled).
#[cfg(feature = "telemetry")]
fn init_tracing(config: &Settings) {
    use opentelemetry_otlp::WithExportConfig;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "callbridge={},tower_http=info",
            config.observability.log_level
        )
        .into()
    });
    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    if let (Some(endpoint), true) = (
        &config.observability.otlp_endpoint,
        config.observability.tracing_enabled,
    ) {
        match opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(
                opentelemetry_sdk::Resource::new(vec![
                    opentelemetry::KeyValue::new("service.name", "callbridge"),
                    opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ]),
            ))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
        {
            Ok(tracer) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                subscriber.with(fmt_layer).with(otel_layer).init();
                tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
                return;
            }
            Err(e) => eprintln!("Failed to initialize OpenTelemetry: {e}. Falling back."),
        }
    }
    subscriber.with(fmt_layer).init();
}

/// Initialize tracing (console only).
#[cfg(not(feature = "telemetry"))]
fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "callbridge={},tower_http=info",
            config.observability.log_level
        )
        .into()
    });
    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
