//! HTTP request surface.
//!
//! Routing-header contract: every query endpoint reads `X-Graph` and
//! resolves a [`ScenarioContext`](crate::context::ScenarioContext) before
//! dispatching through the backend registry.
//!
//! # Status-code policy
//!
//! The `/query/*` endpoints ALWAYS answer 200 and carry failures in the
//! body's `error` field: their caller is an LLM tool that treats non-2xx as
//! fatal and would never see the message. Scenario CRUD endpoints talk to
//! the UI and use conventional status codes. Streaming endpoints answer 200
//! with `text/event-stream` once the stream opens and signal failures with
//! a terminal `error` event.

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::incidentllm::bridge::OrchestrationBridge;
use crate::incidentllm::config::PlatformConfig;
use crate::incidentllm::context::{ContextResolver, GRAPH_HEADER};
use crate::incidentllm::credentials::global_credential;
use crate::incidentllm::error::PlatformError;
use crate::incidentllm::ingest::{IngestPipeline, UploadKind};
use crate::incidentllm::provisioner::AgentProvisioner;
use crate::incidentllm::registry::BackendRegistry;
use crate::incidentllm::runtime::{AgentRuntime, RemoteRuntime, StubRuntime};
use crate::incidentllm::scenario::{SaveScenarioRequest, ScenarioRegistry};
use crate::incidentllm::search::{MemorySearchStore, RestSearchStore, SearchStore};
use crate::incidentllm::sse::{sse_response, EventBus, EventRecord, SseStreamOptions, TagFilter};
use crate::incidentllm::store::{
    CosmosStore, DocQuery, DocumentStore, MemoryStore, PROMPTS_CONTAINER,
    SCENARIO_CONFIGS_CONTAINER,
};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: PlatformConfig,
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn DocumentStore>,
    pub search: Arc<dyn SearchStore>,
    pub registry: Arc<BackendRegistry>,
    pub resolver: Arc<ContextResolver>,
    pub scenarios: Arc<ScenarioRegistry>,
    pub bridge: Arc<OrchestrationBridge>,
    pub provisioner: Arc<AgentProvisioner>,
    pub ingest: Arc<IngestPipeline>,
}

impl AppState {
    /// Wire the full state from configuration. Hosted stores and the remote
    /// runtime are used when their endpoints are configured; everything
    /// else falls back to the in-memory implementations so the platform is
    /// usable with zero external dependencies.
    pub fn from_config(config: PlatformConfig) -> Self {
        let store: Arc<dyn DocumentStore> = if config.cosmos.endpoint.is_some() {
            let credential = global_credential(&config.credentials);
            match CosmosStore::new(&config.cosmos, credential) {
                Ok(cosmos) => Arc::new(cosmos),
                Err(e) => {
                    log::warn!("document store misconfigured ({}); using in-memory store", e);
                    Arc::new(MemoryStore::new())
                }
            }
        } else {
            Arc::new(MemoryStore::new())
        };

        let search: Arc<dyn SearchStore> = match &config.search_endpoint {
            Some(endpoint) => {
                let credential = global_credential(&config.credentials);
                Arc::new(RestSearchStore::new(endpoint.clone(), credential))
            }
            None => Arc::new(MemorySearchStore::new()),
        };

        let runtime: Arc<dyn AgentRuntime> = match &config.runtime.project_endpoint {
            Some(endpoint) => {
                let credential = global_credential(&config.credentials);
                Arc::new(RemoteRuntime::new(endpoint.clone(), credential))
            }
            None => {
                log::info!("agent runtime not configured; using the deterministic stub runtime");
                Arc::new(StubRuntime::new())
            }
        };

        Self::assemble(config, store, search, runtime)
    }

    /// Fully in-memory state for tests and demo mode.
    pub fn demo() -> Self {
        Self::assemble(
            PlatformConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySearchStore::new()),
            Arc::new(StubRuntime::new()),
        )
    }

    /// Demo state with a caller-supplied runtime, for tests that script
    /// failures.
    pub fn demo_with_runtime(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self::assemble(
            PlatformConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySearchStore::new()),
            runtime,
        )
    }

    fn assemble(
        config: PlatformConfig,
        store: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchStore>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        let bus = Arc::new(EventBus::new(
            config.sse.ring_capacity,
            config.sse.queue_capacity,
        ));
        let registry = Arc::new(BackendRegistry::from_config(&config));
        let resolver = Arc::new(ContextResolver::new(config.clone(), store.clone()));
        let scenarios = Arc::new(ScenarioRegistry::new(store.clone()));
        let bridge = Arc::new(OrchestrationBridge::new(
            runtime.clone(),
            bus.clone(),
            store.clone(),
            config.runtime.agent_map_id.clone(),
        ));
        let provisioner = Arc::new(AgentProvisioner::new(
            store.clone(),
            runtime,
            bus.clone(),
            config.clone(),
        ));
        let ingest = Arc::new(IngestPipeline::new(
            store.clone(),
            search.clone(),
            registry.clone(),
            resolver.clone(),
            scenarios.clone(),
            bus.clone(),
        ));
        Self {
            config,
            bus,
            store,
            search,
            registry,
            resolver,
            scenarios,
            bridge,
            provisioner,
            ingest,
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alert", post(submit_alert))
        .route("/agents", get(list_agents))
        .route("/logs", get(stream_logs))
        .route("/query/graph", post(query_graph))
        .route("/query/telemetry", post(query_telemetry))
        .route("/query/topology", post(query_topology))
        .route("/config/apply", post(apply_config))
        .route("/scenarios/saved", get(list_scenarios))
        .route("/scenarios/save", post(save_scenario))
        .route("/scenarios/saved/{name}", delete(delete_scenario))
        .route("/upload/{kind}", post(upload_archive))
        .route("/prompts", get(list_prompts))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state)
}

fn graph_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(GRAPH_HEADER).and_then(|v| v.to_str().ok())
}

/// Status-coded JSON error for the CRUD surface.
fn crud_error(e: &PlatformError) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
    )
}

// ---------------------------------------------------------------------------
// Alert + logs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AlertRequest {
    alert: String,
}

async fn submit_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AlertRequest>,
) -> impl IntoResponse {
    let context = state.resolver.resolve(graph_header(&headers)).await;
    let scenario = context.prompts_scenario.clone();
    let source = state.bridge.clone().submit_alert(request.alert, scenario);

    let subscription = state.bus.subscribe(TagFilter::only(&source));
    let replay = state.bus.tail(&source);
    sse_response(
        subscription,
        SseStreamOptions {
            replay,
            heartbeat: state.config.sse.heartbeat,
            until_terminal: true,
        },
    )
}

#[derive(Deserialize)]
struct LogStreamParams {
    /// Comma-separated source tags; absent means every source.
    sources: Option<String>,
}

async fn stream_logs(
    State(state): State<AppState>,
    Query(params): Query<LogStreamParams>,
) -> impl IntoResponse {
    let filter = match params.sources {
        Some(raw) if !raw.trim().is_empty() => TagFilter::Sources(
            raw.split(',').map(|s| s.trim().to_string()).collect(),
        ),
        _ => TagFilter::Any,
    };
    let subscription = state.bus.subscribe(filter);
    sse_response(
        subscription,
        SseStreamOptions {
            replay: state.bus.tail("app"),
            heartbeat: state.config.sse.heartbeat,
            until_terminal: false,
        },
    )
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    // The agent map is written by the provisioner at activation time.
    let map = state
        .store
        .get(
            SCENARIO_CONFIGS_CONTAINER,
            &state.config.runtime.agent_map_id,
        )
        .await
        .ok()
        .flatten();
    match map {
        Some(doc) => Json(serde_json::json!({
            "scenario": doc.get("scenario_name"),
            "agents": doc.get("agents"),
        })),
        None => Json(serde_json::json!({ "scenario": null, "agents": {} })),
    }
}

// ---------------------------------------------------------------------------
// Query endpoints (always HTTP 200)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    container: Option<String>,
}

async fn query_graph(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Json<serde_json::Value> {
    let context = state.resolver.resolve(graph_header(&headers)).await;
    let outcome = match state.registry.resolve(&context).await {
        Ok(backend) => {
            backend
                .execute_query(&request.query, &context.query_scope(None))
                .await
        }
        Err(e) => crate::incidentllm::backend::QueryOutcome::failed(e.to_string()),
    };
    Json(serde_json::to_value(outcome).unwrap_or_default())
}

async fn query_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Json<serde_json::Value> {
    let context = state.resolver.resolve(graph_header(&headers)).await;
    let scope = context.query_scope(request.container.clone());
    let outcome = match state.registry.resolve(&context).await {
        Ok(backend) => backend.execute_query(&request.query, &scope).await,
        Err(e) => crate::incidentllm::backend::QueryOutcome::failed(e.to_string()),
    };
    Json(serde_json::to_value(outcome).unwrap_or_default())
}

#[derive(Deserialize, Default)]
struct TopologyRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    vertex_labels: Option<Vec<String>>,
}

async fn query_topology(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TopologyRequest>,
) -> Json<serde_json::Value> {
    let context = state.resolver.resolve(graph_header(&headers)).await;
    let outcome = match state.registry.resolve(&context).await {
        Ok(backend) => {
            backend
                .get_topology(
                    request.query.as_deref(),
                    request.vertex_labels.as_deref(),
                    &context.query_scope(None),
                )
                .await
        }
        Err(e) => crate::incidentllm::backend::TopologyOutcome::failed(e.to_string()),
    };
    Json(serde_json::to_value(outcome).unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct ApplyConfigRequest {
    #[serde(default)]
    scenario: Option<String>,
    #[serde(default)]
    prompt_scenario: Option<String>,
    #[serde(default)]
    graph: Option<String>,
}

async fn apply_config(
    State(state): State<AppState>,
    Json(request): Json<ApplyConfigRequest>,
) -> impl IntoResponse {
    let scenario = request
        .scenario
        .or(request.prompt_scenario)
        .or_else(|| {
            request
                .graph
                .as_deref()
                .map(|g| crate::incidentllm::context::scenario_prefix(g).to_string())
        })
        .unwrap_or_else(|| state.config.default_scenario.clone());

    let source = format!("activation:{}", uuid::Uuid::new_v4());
    let subscription = state.bus.subscribe(TagFilter::only(&source));

    let task_state = state.clone();
    let task_source = source.clone();
    tokio::spawn(async move {
        match task_state
            .provisioner
            .activate(&scenario, &task_source)
            .await
        {
            Ok(agents) => task_state.bus.publish(
                &task_source,
                EventRecord::complete(serde_json::json!({ "agents": agents })),
            ),
            Err(e) => task_state.bus.publish(
                &task_source,
                EventRecord::of(
                    crate::incidentllm::sse::KIND_ERROR,
                    serde_json::json!({ "error": e.to_string(), "kind": e.kind() }),
                ),
            ),
        }
    });

    sse_response(
        subscription,
        SseStreamOptions {
            replay: Vec::new(),
            heartbeat: state.config.sse.heartbeat,
            until_terminal: true,
        },
    )
}

// ---------------------------------------------------------------------------
// Scenario CRUD
// ---------------------------------------------------------------------------

async fn list_scenarios(State(state): State<AppState>) -> impl IntoResponse {
    match state.scenarios.list().await {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!({ "scenarios": records }))),
        Err(e) => crud_error(&e),
    }
}

async fn save_scenario(
    State(state): State<AppState>,
    Json(request): Json<SaveScenarioRequest>,
) -> impl IntoResponse {
    match state.scenarios.save(request).await {
        Ok(record) => (
            StatusCode::OK,
            Json(serde_json::to_value(record).unwrap_or_default()),
        ),
        Err(e) => crud_error(&e),
    }
}

async fn delete_scenario(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.scenarios.delete(&name).await {
        Ok(()) => (StatusCode::NO_CONTENT, Json(serde_json::json!({}))),
        Err(e) => crud_error(&e),
    }
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

async fn upload_archive(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let kind = match UploadKind::from_str(&kind) {
        Ok(kind) => kind,
        Err(e) => return crud_error(&e).into_response(),
    };
    let scenario_override = params.get("scenario_name").cloned();

    let source = format!("upload:{}:{}", kind.as_str(), uuid::Uuid::new_v4());
    let subscription = state.bus.subscribe(TagFilter::only(&source));

    let task_state = state.clone();
    let task_source = source.clone();
    let archive = body.to_vec();
    tokio::spawn(async move {
        task_state
            .ingest
            .run_upload(kind, scenario_override, archive, &task_source)
            .await;
    });

    sse_response(
        subscription,
        SseStreamOptions {
            replay: Vec::new(),
            heartbeat: state.config.sse.heartbeat,
            until_terminal: true,
        },
    )
    .into_response()
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct PromptListParams {
    #[serde(default)]
    include_content: Option<bool>,
    #[serde(default)]
    scenario: Option<String>,
}

async fn list_prompts(
    State(state): State<AppState>,
    Query(params): Query<PromptListParams>,
) -> impl IntoResponse {
    let filter = match &params.scenario {
        Some(scenario) => DocQuery::field_eq("scenario", serde_json::json!(scenario)),
        None => DocQuery::all(),
    };
    let docs = match state.store.query(PROMPTS_CONTAINER, &filter).await {
        Ok(docs) => docs,
        Err(PlatformError::ResourceNotFound(_)) => Vec::new(),
        Err(e) => return crud_error(&e),
    };

    // include_content=true returns everything in one response so callers
    // never fall into the N-plus-one fetch pattern.
    let include_content = params.include_content.unwrap_or(false);
    let prompts: Vec<serde_json::Value> = docs
        .into_iter()
        .map(|doc| {
            let mut entry = serde_json::json!({
                "id": doc.get("id"),
                "agent": doc.get("agent"),
                "scenario": doc.get("scenario"),
                "version": doc.get("version"),
                "timestamp": doc.get("timestamp"),
            });
            if include_content {
                entry["content"] = doc.get("content").cloned().unwrap_or_default();
            }
            entry
        })
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({ "prompts": prompts })),
    )
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "default_scenario": state.config.default_scenario,
        "default_backend": state.config.default_backend.connector_key(),
        "cached_backends": state.registry.cached_count().await,
    }))
}
