//! API surface tests over in-memory stores.
//!
//! Exercises the HTTP contracts end to end without external services:
//! organizations, agents (phone conflict reporting), outbound calls
//! against a scripted SIP control plane, and the full ingestion flow for
//! a markdown upload.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::util::ServiceExt;

use callbridge_config::Settings;
use callbridge_core::EventBroker;
use callbridge_ingest::{
    ChunkerConfig, DocumentChunker, DocumentParser, IngestionPipeline, ParseServiceConfig,
    PipelineOptions, RetentionService,
};
use callbridge_integrations::{Dispatcher, DispatcherConfig, WebhookPlugin};
use callbridge_llm::{OpenAiBackend, OpenAiConfig};
use callbridge_persistence::memory::{
    MemoryAgentStore, MemoryCallSessionStore, MemoryIngestStore, MemoryIntegrationStore,
    MemoryMetricsStore, MemoryOrganizationStore,
};
use callbridge_rag::{EmbeddingClient, EmbeddingClientConfig, KnowledgeRetriever, RetrieverConfig};
use callbridge_telephony::{
    CallOrchestrator, OrchestratorConfig, ScriptedControlPlane,
};

use callbridge_server::{
    adapters::{NullDenseSearcher, SparseOnlyVectorSink},
    create_router, init_metrics,
    state::{AppState, ChunkAnalyticsSource},
    ShutdownCoordinator,
};

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

fn test_app() -> Router {
    let ingest_store = Arc::new(MemoryIngestStore::default());
    let embedder = Arc::new(EmbeddingClient::new(EmbeddingClientConfig::default()));
    let retriever = Arc::new(KnowledgeRetriever::new(
        Arc::new(NullDenseSearcher),
        embedder,
        RetrieverConfig::default(),
    ));
    let vector_sink = Arc::new(SparseOnlyVectorSink {
        retriever: retriever.clone(),
    });
    let ingestion = IngestionPipeline::new(
        Arc::new(DocumentParser::new(ParseServiceConfig::default())),
        Arc::new(DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            ..Default::default()
        })),
        ingest_store.clone(),
        vector_sink.clone(),
        PipelineOptions::default(),
    );
    let retention = Arc::new(RetentionService::new(
        ingest_store.clone(),
        vector_sink,
        ingestion.clone(),
    ));

    let broker = Arc::new(EventBroker::default());
    let orchestrator = CallOrchestrator::new(
        Arc::new(ScriptedControlPlane::default()),
        broker.clone(),
        OrchestratorConfig {
            max_concurrent_calls: 2,
            ..Default::default()
        },
    );

    let state = AppState {
        config: Arc::new(Settings::default()),
        organizations: Arc::new(MemoryOrganizationStore::default()),
        agents: Arc::new(MemoryAgentStore::default()),
        call_sessions: Arc::new(MemoryCallSessionStore::default()),
        metrics: Arc::new(MemoryMetricsStore::default()),
        integration_store: Arc::new(MemoryIntegrationStore::default()),
        orchestrator,
        ingestion,
        retention,
        retriever,
        dispatcher: Arc::new(
            Dispatcher::new(DispatcherConfig::default()).register(Arc::new(WebhookPlugin::new())),
        ),
        broker,
        llm: Arc::new(OpenAiBackend::new(OpenAiConfig::default())),
        chunk_source: Arc::new(MemoryChunkSource(ingest_store)),
        shutdown: Arc::new(ShutdownCoordinator::new()),
        voice_sessions: Arc::new(dashmap::DashMap::new()),
        persistent: false,
    };
    create_router(state, init_metrics())
}

async fn request_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_is_healthy() {
    let app = test_app();
    let (status, body) = request_json(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn metrics_exposition_renders() {
    let app = test_app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn organization_slug_round_trip_and_conflict() {
    let app = test_app();

    let (status, created) = request_json(
        &app,
        "POST",
        "/api/v1/organizations/create",
        Some(serde_json::json!({"slug": "acme", "name": "Acme"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let org_id = created["organization_id"].as_str().unwrap().to_string();

    let (status, fetched) =
        request_json(&app, "GET", "/api/v1/organizations/slug/acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["organization_id"], org_id.as_str());

    // Duplicate slug answers 409 with the structured error body.
    let (status, error) = request_json(
        &app,
        "POST",
        "/api/v1/organizations/create",
        Some(serde_json::json!({"slug": "acme", "name": "Acme 2"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["status"], "error");
}

async fn create_org_and_agent(app: &Router, phone: Option<Value>) -> (String, String) {
    let (_, org) = request_json(
        app,
        "POST",
        "/api/v1/organizations/create",
        Some(serde_json::json!({"slug": format!("org-{}", uuid::Uuid::new_v4()), "name": "T"})),
    )
    .await;
    let org_id = org["organization_id"].as_str().unwrap().to_string();

    let mut body = serde_json::json!({
        "organization_id": org_id,
        "display_name": "Asha",
        "system_prompt": "Be helpful and brief.",
        "language": "hi-IN",
    });
    if let Some(phone) = phone {
        body["phone"] = phone;
    }
    let (status, agent) = request_json(app, "POST", "/api/v1/agents/create", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    (org_id, agent["agent_id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn agent_phone_conflicts_are_reported_not_rejected() {
    let app = test_app();
    let phone = serde_json::json!({"country_code": "+91", "number": "9876543210"});

    let (_org1, first) = create_org_and_agent(&app, Some(phone.clone())).await;
    let (_org2, _second) = create_org_and_agent(&app, Some(phone)).await;

    let (status, validation) = request_json(
        &app,
        "GET",
        &format!("/api/v1/agents/validate/{first}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validation["valid"], false);
    assert_eq!(validation["conflictingAgents"].as_array().unwrap().len(), 1);
    assert!(validation["warning"].is_string());
}

#[tokio::test]
async fn outbound_call_contract() {
    let app = test_app();
    let (org_id, agent_id) = create_org_and_agent(&app, None).await;

    // Bad phone: 400.
    let (status, _) = request_json(
        &app,
        "POST",
        "/api/v1/calls/outbound",
        Some(serde_json::json!({
            "organizationId": org_id,
            "agentId": agent_id,
            "phoneNumber": "0123",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Happy path: ringing state, parseable room name.
    let (status, call) = request_json(
        &app,
        "POST",
        "/api/v1/calls/outbound",
        Some(serde_json::json!({
            "organizationId": org_id,
            "agentId": agent_id,
            "phoneNumber": "+919876543210",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(call["success"], true);
    assert_eq!(call["state"], "ringing");
    let room = call["roomName"].as_str().unwrap();
    assert!(room.starts_with(&format!("sip_{org_id}_{agent_id}_")));

    // The session row exists and carries the destination number.
    let session_id = call["callId"].as_str().unwrap();
    let (status, session) =
        request_json(&app, "GET", &format!("/api/v1/calls/{session_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        session["session"]["destination_phone_number"],
        "+919876543210"
    );

    // Admission cap (2) rejects the third call with 429.
    let _ = request_json(
        &app,
        "POST",
        "/api/v1/calls/outbound",
        Some(serde_json::json!({
            "organizationId": org_id,
            "agentId": agent_id,
            "phoneNumber": "+919876543211",
        })),
    )
    .await;
    let (status, _) = request_json(
        &app,
        "POST",
        "/api/v1/calls/outbound",
        Some(serde_json::json!({
            "organizationId": org_id,
            "agentId": agent_id,
            "phoneNumber": "+919876543212",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

fn multipart_body(boundary: &str, file_name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

#[tokio::test]
async fn ingestion_flow_upload_preview_confirm() {
    let app = test_app();
    let (org_id, agent_id) = create_org_and_agent(&app, None).await;

    let boundary = "cbtestboundary";
    let content = b"# Fees\n\nThe processing fee is one percent of the sanctioned loan amount.\n\n# Eligibility\n\nApplicants must be at least eighteen years old.";
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/api/v1/documents/ingest?agent_id={agent_id}&organization_id={org_id}"
        ))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(multipart_body(boundary, "guide.md", content)))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let upload: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(upload["stage"], "uploading");
    assert_eq!(upload["previewEnabled"], true);
    let session_id = upload["sessionId"].as_str().unwrap().to_string();

    // Poll status until preview_ready.
    let mut stage = String::new();
    for _ in 0..100 {
        let (status, body) = request_json(
            &app,
            "GET",
            &format!("/api/v1/documents/{session_id}/status"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        stage = body["stage"].as_str().unwrap_or_default().to_string();
        if stage == "preview_ready" || stage == "failed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(stage, "preview_ready");

    // Chunks are previewable.
    let (status, chunks) = request_json(
        &app,
        "GET",
        &format!("/api/v1/documents/{session_id}/chunks"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let chunk_count = chunks["count"].as_u64().unwrap();
    assert!(chunk_count >= 1);

    // Confirm: ragIds.len() == chunksCreated; idempotent.
    let (status, confirmed) = request_json(
        &app,
        "POST",
        &format!("/api/v1/documents/{session_id}/confirm"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["success"], true);
    let rag_ids = confirmed["ragIds"].as_array().unwrap().len() as u64;
    assert_eq!(rag_ids, confirmed["chunksCreated"].as_u64().unwrap());

    let (_, again) = request_json(
        &app,
        "POST",
        &format!("/api/v1/documents/{session_id}/confirm"),
        None,
    )
    .await;
    assert_eq!(again["ragIds"], confirmed["ragIds"]);

    // Terminal status.
    let (_, body) = request_json(
        &app,
        "GET",
        &format!("/api/v1/documents/{session_id}/status"),
        None,
    )
    .await;
    assert_eq!(body["status"], "completed");

    // Cancel after completion reports conflict.
    let (status, _) = request_json(
        &app,
        "POST",
        &format!("/api/v1/documents/{session_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unsupported_upload_is_rejected() {
    let app = test_app();
    let (org_id, agent_id) = create_org_and_agent(&app, None).await;

    let boundary = "cbtestboundary";
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/api/v1/documents/ingest?agent_id={agent_id}&organization_id={org_id}"
        ))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(multipart_body(boundary, "tool.exe", b"MZ")))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn transcript_of_unknown_call_is_404() {
    let app = test_app();
    let (status, error) =
        request_json(&app, "GET", "/api/v1/calls/ghost/transcript", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["status"], "error");
}
