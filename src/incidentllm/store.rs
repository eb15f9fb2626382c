//! Document-store abstraction.
//!
//! One minimal interface serves the scenario registry, scenario configs,
//! prompts, telemetry rows, and interaction history. Two implementations:
//! [`MemoryStore`] for tests and demo mode, and [`CosmosStore`] speaking the
//! document database's REST surface with bearer auth.
//!
//! # Control plane vs data plane
//!
//! Container creation is a management-plane operation that needs elevated
//! privileges and can block for 10-30 seconds. Data operations are fast.
//! The two are split on purpose: write paths call
//! [`DocumentStore::ensure_container`] explicitly before their first upsert;
//! read paths never do and fail with `resource_not_found` when the container
//! is absent. Collapsing the two was observed to stall every read behind a
//! 30 s control-plane call.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::incidentllm::config::CosmosConfig;
use crate::incidentllm::credentials::TokenCredential;
use crate::incidentllm::backends::common::get_shared_http_client;
use crate::incidentllm::error::{PlatformError, Result};

/// Scenario registry documents, partition key `/id`.
pub const SCENARIOS_CONTAINER: &str = "scenarios";
/// Parsed scenario manifests, partition key `/scenario_name`.
pub const SCENARIO_CONFIGS_CONTAINER: &str = "scenario-configs";
/// Prompt documents, partition key `/agent`.
pub const PROMPTS_CONTAINER: &str = "prompts";
/// Completed run records, partition key `/scenario`.
pub const HISTORY_CONTAINER: &str = "interaction-history";

/// Partition key path declared when a well-known container is created.
pub fn partition_key_for(container: &str) -> &'static str {
    match container {
        SCENARIOS_CONTAINER => "/id",
        SCENARIO_CONFIGS_CONTAINER => "/scenario_name",
        PROMPTS_CONTAINER => "/agent",
        HISTORY_CONTAINER => "/scenario",
        _ => "/id",
    }
}

/// Document ids travel in URL path segments on the REST surface, so the
/// reserved characters are rejected up front. `__` is the segment separator
/// (e.g. `telco-noc__orchestrator__v1`).
pub fn validate_document_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PlatformError::validation("document id must not be empty"));
    }
    if let Some(bad) = id.chars().find(|c| matches!(c, '/' | '\\' | '?' | '#')) {
        return Err(PlatformError::validation(format!(
            "document id '{}' contains forbidden character '{}'",
            id, bad
        )));
    }
    Ok(())
}

/// Structured equality filter, translatable both to an in-memory scan and to
/// a SQL WHERE clause on the remote store.
#[derive(Debug, Clone, Default)]
pub struct DocQuery {
    pub equals: Vec<(String, Value)>,
}

impl DocQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field_eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            equals: vec![(field.into(), value)],
        }
    }

    fn matches(&self, doc: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Minimal document-store interface.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Control-plane accessor: create the container if absent. Only
    /// ingest/create paths call this; it may block on the management API.
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Fetch a document by id, or `Ok(None)` when the document is absent.
    /// Errors with `resource_not_found` when the container itself is absent.
    async fn get(&self, container: &str, id: &str) -> Result<Option<Value>>;

    /// Insert-or-overwrite. The caller must have ensured the container on
    /// its write path; this method does not touch the control plane.
    async fn upsert(&self, container: &str, doc: Value) -> Result<Value>;

    /// All documents matching the filter.
    async fn query(&self, container: &str, filter: &DocQuery) -> Result<Vec<Value>>;

    /// Delete by id. Returns whether a document was removed.
    async fn delete(&self, container: &str, id: &str) -> Result<bool>;
}

fn doc_id(doc: &Value) -> Result<String> {
    doc.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PlatformError::validation("document is missing string field 'id'"))
}

/// In-memory implementation backing tests and demo mode.
pub struct MemoryStore {
    containers: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        self.containers
            .lock()
            .await
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn get(&self, container: &str, id: &str) -> Result<Option<Value>> {
        validate_document_id(id)?;
        let containers = self.containers.lock().await;
        match containers.get(container) {
            Some(docs) => Ok(docs.get(id).cloned()),
            None => Err(PlatformError::resource_not_found(format!(
                "container '{}' does not exist",
                container
            ))),
        }
    }

    async fn upsert(&self, container: &str, doc: Value) -> Result<Value> {
        let id = doc_id(&doc)?;
        validate_document_id(&id)?;
        let mut containers = self.containers.lock().await;
        let docs = containers.get_mut(container).ok_or_else(|| {
            PlatformError::resource_not_found(format!(
                "container '{}' does not exist; writers must ensure_container first",
                container
            ))
        })?;
        docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn query(&self, container: &str, filter: &DocQuery) -> Result<Vec<Value>> {
        let containers = self.containers.lock().await;
        match containers.get(container) {
            Some(docs) => Ok(docs.values().filter(|d| filter.matches(d)).cloned().collect()),
            None => Err(PlatformError::resource_not_found(format!(
                "container '{}' does not exist",
                container
            ))),
        }
    }

    async fn delete(&self, container: &str, id: &str) -> Result<bool> {
        validate_document_id(id)?;
        let mut containers = self.containers.lock().await;
        match containers.get_mut(container) {
            Some(docs) => Ok(docs.remove(id).is_some()),
            None => Err(PlatformError::resource_not_found(format!(
                "container '{}' does not exist",
                container
            ))),
        }
    }
}

/// REST implementation against the hosted document database.
///
/// Auth is a bearer token from the shared credential provider. Query
/// pushdown is limited to the [`DocQuery`] equality filter, which is all the
/// platform needs.
pub struct CosmosStore {
    endpoint: String,
    database: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
}

impl CosmosStore {
    pub fn new(config: &CosmosConfig, credential: Arc<dyn TokenCredential>) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            PlatformError::config_missing("COSMOS_ENDPOINT is required for the document store")
        })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            scope: "https://cosmos.azure.com/.default".to_string(),
            credential,
        })
    }

    fn collection_url(&self, container: &str) -> String {
        format!(
            "{}/dbs/{}/colls/{}",
            self.endpoint,
            urlencoding::encode(&self.database),
            urlencoding::encode(container)
        )
    }

    async fn bearer(&self) -> Result<String> {
        self.credential.token(&self.scope).await
    }

    fn sql_for(filter: &DocQuery) -> (String, Vec<Value>) {
        if filter.equals.is_empty() {
            return ("SELECT * FROM c".to_string(), Vec::new());
        }
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (i, (field, value)) in filter.equals.iter().enumerate() {
            clauses.push(format!("c.{} = @p{}", field, i));
            params.push(serde_json::json!({
                "name": format!("@p{}", i),
                "value": value,
            }));
        }
        (
            format!("SELECT * FROM c WHERE {}", clauses.join(" AND ")),
            params,
        )
    }
}

#[async_trait]
impl DocumentStore for CosmosStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        let token = self.bearer().await?;
        let body = serde_json::json!({
            "id": container,
            "partitionKey": {
                "paths": [partition_key_for(container)],
                "kind": "Hash",
            },
        });
        let response = get_shared_http_client()
            .post(format!(
                "{}/dbs/{}/colls",
                self.endpoint,
                urlencoding::encode(&self.database)
            ))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        // 409 means the container already exists, which is the steady state.
        if response.status().is_success() || response.status().as_u16() == 409 {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(PlatformError::upstream(format!(
                "container create for '{}' failed ({}): {}",
                container, status, text
            )))
        }
    }

    async fn get(&self, container: &str, id: &str) -> Result<Option<Value>> {
        validate_document_id(id)?;
        let token = self.bearer().await?;
        let response = get_shared_http_client()
            .get(format!(
                "{}/docs/{}",
                self.collection_url(container),
                urlencoding::encode(id)
            ))
            .bearer_auth(&token)
            .send()
            .await?;
        match response.status().as_u16() {
            200 => Ok(Some(response.json().await.map_err(PlatformError::from)?)),
            404 => Ok(None),
            401 | 403 => Err(PlatformError::auth(format!(
                "document store rejected credentials for '{}'",
                container
            ))),
            status => Err(PlatformError::upstream(format!(
                "document get failed with status {}",
                status
            ))),
        }
    }

    async fn upsert(&self, container: &str, doc: Value) -> Result<Value> {
        let id = doc_id(&doc)?;
        validate_document_id(&id)?;
        let token = self.bearer().await?;
        let response = get_shared_http_client()
            .post(format!("{}/docs", self.collection_url(container)))
            .bearer_auth(&token)
            .header("x-ms-documentdb-is-upsert", "true")
            .json(&doc)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(doc)
        } else if response.status().as_u16() == 404 {
            Err(PlatformError::resource_not_found(format!(
                "container '{}' does not exist; writers must ensure_container first",
                container
            )))
        } else {
            let status = response.status();
            Err(PlatformError::upstream(format!(
                "document upsert failed with status {}",
                status
            )))
        }
    }

    async fn query(&self, container: &str, filter: &DocQuery) -> Result<Vec<Value>> {
        let token = self.bearer().await?;
        let (sql, params) = Self::sql_for(filter);
        let response = get_shared_http_client()
            .post(format!("{}/docs/query", self.collection_url(container)))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "query": sql, "parameters": params }))
            .send()
            .await?;
        match response.status().as_u16() {
            200 => {
                let body: Value = response.json().await.map_err(PlatformError::from)?;
                Ok(body
                    .get("Documents")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default())
            }
            404 => Err(PlatformError::resource_not_found(format!(
                "container '{}' does not exist",
                container
            ))),
            status => Err(PlatformError::upstream(format!(
                "document query failed with status {}",
                status
            ))),
        }
    }

    async fn delete(&self, container: &str, id: &str) -> Result<bool> {
        validate_document_id(id)?;
        let token = self.bearer().await?;
        let response = get_shared_http_client()
            .delete(format!(
                "{}/docs/{}",
                self.collection_url(container),
                urlencoding::encode(id)
            ))
            .bearer_auth(&token)
            .send()
            .await?;
        match response.status().as_u16() {
            200 | 204 => Ok(true),
            404 => Ok(false),
            status => Err(PlatformError::upstream(format!(
                "document delete failed with status {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_rejects_reserved_characters() {
        assert!(validate_document_id("telco-noc__orchestrator__v1").is_ok());
        assert!(validate_document_id("a/b").is_err());
        assert!(validate_document_id("a\\b").is_err());
        assert!(validate_document_id("a?b").is_err());
        assert!(validate_document_id("a#b").is_err());
        assert!(validate_document_id("").is_err());
    }

    #[tokio::test]
    async fn memory_store_read_fails_before_container_exists() {
        let store = MemoryStore::new();
        let err = store.get(SCENARIOS_CONTAINER, "demo").await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");
    }

    #[tokio::test]
    async fn memory_store_upsert_overwrites_in_place() {
        let store = MemoryStore::new();
        store.ensure_container(SCENARIOS_CONTAINER).await.unwrap();

        store
            .upsert(SCENARIOS_CONTAINER, serde_json::json!({"id": "s1", "v": 1}))
            .await
            .unwrap();
        store
            .upsert(SCENARIOS_CONTAINER, serde_json::json!({"id": "s1", "v": 2}))
            .await
            .unwrap();

        let doc = store.get(SCENARIOS_CONTAINER, "s1").await.unwrap().unwrap();
        assert_eq!(doc["v"], 2);
    }

    #[tokio::test]
    async fn memory_store_query_filters_by_field() {
        let store = MemoryStore::new();
        store.ensure_container(PROMPTS_CONTAINER).await.unwrap();
        store
            .upsert(
                PROMPTS_CONTAINER,
                serde_json::json!({"id": "s__a__v1", "agent": "a"}),
            )
            .await
            .unwrap();
        store
            .upsert(
                PROMPTS_CONTAINER,
                serde_json::json!({"id": "s__b__v1", "agent": "b"}),
            )
            .await
            .unwrap();

        let filtered = store
            .query(
                PROMPTS_CONTAINER,
                &DocQuery::field_eq("agent", serde_json::json!("a")),
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["id"], "s__a__v1");
    }

    #[test]
    fn cosmos_sql_translation() {
        let (sql, params) = CosmosStore::sql_for(&DocQuery::field_eq(
            "scenario_name",
            serde_json::json!("telco-noc"),
        ));
        assert_eq!(sql, "SELECT * FROM c WHERE c.scenario_name = @p0");
        assert_eq!(params[0]["value"], "telco-noc");
    }
}
