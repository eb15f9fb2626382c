//! KQL telemetry backend.
//!
//! Executes KQL against the cluster's REST query endpoint with bearer auth.
//! Telemetry only: graph operations answer with a clear error so the agent
//! learns to use the graph tool instead.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::incidentllm::backend::{
    BackendKind, GraphBackend, GraphEdge, GraphVertex, IngestOptions, IngestReport, LifecycleGate,
    QueryOutcome, QueryScope, TopologyOutcome,
};
use crate::incidentllm::backends::common::{get_shared_http_client, retry_with_backoff, BackoffPolicy};
use crate::incidentllm::config::KustoConfig;
use crate::incidentllm::credentials::TokenCredential;
use crate::incidentllm::error::{PlatformError, Result};

#[derive(Debug)]
pub struct KustoBackend {
    cluster_uri: String,
    database: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
    policy: BackoffPolicy,
    gate: LifecycleGate,
}

impl KustoBackend {
    pub fn new(config: &KustoConfig, credential: Arc<dyn TokenCredential>) -> Result<Self> {
        let cluster_uri = config
            .cluster_uri
            .clone()
            .ok_or_else(|| PlatformError::config_missing("KUSTO_CLUSTER_URI"))?;
        let scope = format!("{}/.default", cluster_uri.trim_end_matches('/'));
        Ok(Self {
            cluster_uri,
            database: config.database.clone(),
            scope,
            credential,
            policy: BackoffPolicy::default(),
            gate: LifecycleGate::new(),
        })
    }

    async fn submit(&self, csl: &str, database: &str) -> Result<Value> {
        let url = format!("{}/v2/rest/query", self.cluster_uri.trim_end_matches('/'));
        let body = serde_json::json!({ "db": database, "csl": csl });
        retry_with_backoff(
            &self.policy,
            || {
                let url = &url;
                let body = &body;
                let credential = &self.credential;
                let scope = &self.scope;
                async move {
                    let token = credential.token(scope).await?;
                    let response = get_shared_http_client()
                        .post(url)
                        .bearer_auth(&token)
                        .json(body)
                        .send()
                        .await
                        .map_err(|e| {
                            PlatformError::upstream(format!("kusto cluster unreachable: {}", e))
                        })?;
                    match response.status().as_u16() {
                        200 => response.json().await.map_err(PlatformError::from),
                        429 => Err(PlatformError::rate_limit("kusto cluster throttled request")),
                        401 | 403 => Err(PlatformError::auth("kusto cluster rejected token")),
                        400 => {
                            let text = response.text().await.unwrap_or_default();
                            Err(PlatformError::query_syntax(text))
                        }
                        status => Err(PlatformError::upstream(format!(
                            "kusto cluster returned {}",
                            status
                        ))),
                    }
                }
            },
            || {
                let credential = &self.credential;
                let scope = &self.scope;
                async move {
                    credential.invalidate(scope).await;
                }
            },
        )
        .await
    }
}

/// The v2 response is a list of frames; the rows we want live in the
/// `PrimaryResult` data table.
fn primary_result(payload: &Value) -> QueryOutcome {
    let frames = match payload.as_array() {
        Some(frames) => frames,
        None => return QueryOutcome::failed("unexpected kusto response shape"),
    };
    for frame in frames {
        let is_primary = frame.get("TableKind").and_then(Value::as_str) == Some("PrimaryResult")
            || frame.get("TableName").and_then(Value::as_str) == Some("PrimaryResult");
        if !is_primary {
            continue;
        }
        let columns: Vec<String> = frame
            .get("Columns")
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter()
                    .filter_map(|c| c.get("ColumnName").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let rows = frame
            .get("Rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return QueryOutcome::rows(columns, rows);
    }
    QueryOutcome::failed("kusto response contained no PrimaryResult table")
}

#[async_trait]
impl GraphBackend for KustoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kusto
    }

    async fn execute_query(&self, query: &str, scope: &QueryScope) -> QueryOutcome {
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(e) => return QueryOutcome::failed(e.to_string()),
        };
        let database = if scope.telemetry_database.is_empty() {
            &self.database
        } else {
            &scope.telemetry_database
        };
        match self.submit(query, database).await {
            Ok(payload) => primary_result(&payload),
            Err(e) => QueryOutcome::failed(e.to_string()),
        }
    }

    async fn get_topology(
        &self,
        _query: Option<&str>,
        _vertex_labels: Option<&[String]>,
        _scope: &QueryScope,
    ) -> TopologyOutcome {
        TopologyOutcome::failed(
            "kusto is a telemetry backend and has no graph; use the graph query tool for topology",
        )
    }

    async fn ingest(
        &self,
        _vertices: Vec<GraphVertex>,
        _edges: Vec<GraphEdge>,
        _options: &IngestOptions,
    ) -> Result<IngestReport> {
        Err(PlatformError::not_supported(
            "kusto tables are loaded externally; this backend is query-only",
        ))
    }

    async fn close(&self) -> Result<()> {
        self.gate.close().await;
        Ok(())
    }
}
