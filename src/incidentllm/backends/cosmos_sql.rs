//! Document-SQL telemetry backend.
//!
//! Runs SQL queries against the document database's REST surface. The
//! telemetry container is chosen from the query scope (`{scenario}` prefix
//! convention, same as the ingestion pipeline writes).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::incidentllm::backend::{
    BackendKind, GraphBackend, GraphEdge, GraphVertex, IngestOptions, IngestReport, LifecycleGate,
    QueryOutcome, QueryScope, TopologyOutcome,
};
use crate::incidentllm::backends::common::{get_shared_http_client, retry_with_backoff, BackoffPolicy};
use crate::incidentllm::config::CosmosConfig;
use crate::incidentllm::credentials::TokenCredential;
use crate::incidentllm::error::{PlatformError, Result};

#[derive(Debug)]
pub struct CosmosSqlBackend {
    endpoint: String,
    database: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
    policy: BackoffPolicy,
    gate: LifecycleGate,
}

impl CosmosSqlBackend {
    pub fn new(config: &CosmosConfig, credential: Arc<dyn TokenCredential>) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PlatformError::config_missing("COSMOS_ENDPOINT"))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            scope: "https://cosmos.azure.com/.default".to_string(),
            credential,
            policy: BackoffPolicy::default(),
            gate: LifecycleGate::new(),
        })
    }

    async fn submit(&self, sql: &str, database: &str, container: &str) -> Result<Vec<Value>> {
        let url = format!(
            "{}/dbs/{}/colls/{}/docs/query",
            self.endpoint,
            urlencoding::encode(database),
            urlencoding::encode(container)
        );
        let body = serde_json::json!({ "query": sql, "parameters": [] });
        retry_with_backoff(
            &self.policy,
            || {
                let url = &url;
                let body = &body;
                let credential = &self.credential;
                let scope = &self.scope;
                let container = container;
                async move {
                    let token = credential.token(scope).await?;
                    let response = get_shared_http_client()
                        .post(url)
                        .bearer_auth(&token)
                        .json(body)
                        .send()
                        .await
                        .map_err(|e| {
                            PlatformError::upstream(format!("document database unreachable: {}", e))
                        })?;
                    match response.status().as_u16() {
                        200 => {
                            let payload: Value =
                                response.json().await.map_err(PlatformError::from)?;
                            Ok(payload
                                .get("Documents")
                                .and_then(Value::as_array)
                                .cloned()
                                .unwrap_or_default())
                        }
                        429 => Err(PlatformError::rate_limit("document database throttled request")),
                        401 | 403 => Err(PlatformError::auth("document database rejected token")),
                        404 => Err(PlatformError::resource_not_found(format!(
                            "telemetry container '{}' does not exist",
                            container
                        ))),
                        400 => {
                            let text = response.text().await.unwrap_or_default();
                            Err(PlatformError::query_syntax(text))
                        }
                        status => Err(PlatformError::upstream(format!(
                            "document database returned {}",
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

fn columns_from_rows(rows: &[Value]) -> Vec<String> {
    let mut columns: Vec<String> = rows
        .first()
        .and_then(Value::as_object)
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default();
    columns.retain(|c| !c.starts_with('_'));
    columns
}

#[async_trait]
impl GraphBackend for CosmosSqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CosmosSql
    }

    async fn execute_query(&self, query: &str, scope: &QueryScope) -> QueryOutcome {
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(e) => return QueryOutcome::failed(e.to_string()),
        };
        let container = match &scope.container {
            Some(container) => container.clone(),
            None => {
                return QueryOutcome::failed(
                    "telemetry query needs a container; pass one in the request body",
                )
            }
        };
        match self
            .submit(query, &scope.telemetry_database, &container)
            .await
        {
            Ok(rows) => QueryOutcome::rows(columns_from_rows(&rows), rows),
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
            "cosmosdb-sql is a telemetry backend and has no graph; use the graph query tool",
        )
    }

    async fn ingest(
        &self,
        _vertices: Vec<GraphVertex>,
        _edges: Vec<GraphEdge>,
        _options: &IngestOptions,
    ) -> Result<IngestReport> {
        Err(PlatformError::not_supported(
            "telemetry rows are loaded by the ingestion pipeline, not the query backend",
        ))
    }

    async fn close(&self) -> Result<()> {
        self.gate.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_skip_system_fields() {
        let rows = vec![serde_json::json!({
            "device": "RTR-SYD-01", "errors": 12, "_rid": "x", "_etag": "y"
        })];
        let columns = columns_from_rows(&rows);
        assert!(columns.contains(&"device".to_string()));
        assert!(!columns.iter().any(|c| c.starts_with('_')));
    }

    #[test]
    fn empty_rows_yield_no_columns() {
        assert!(columns_from_rows(&[]).is_empty());
    }
}
