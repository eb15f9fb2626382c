//! Backend protocol abstraction layer.
//!
//! Every data source the platform can investigate against (native graph
//! database, remote GQL endpoint, KQL cluster, document-SQL store, or the
//! in-memory mock) implements [`GraphBackend`]. The registry
//! (`crate::registry`) owns instantiation and caching; nothing outside the
//! registry constructs a backend.
//!
//! # Errors travel in the body
//!
//! [`GraphBackend::execute_query`] and [`GraphBackend::get_topology`] return
//! outcomes, not `Result`s: a failed query produces
//! `QueryOutcome { error: Some(...) }`. The HTTP layer serializes that
//! outcome with status 200 so the LLM consumer reads the message and
//! self-corrects; a 4xx/5xx would be swallowed as fatal by the hosted
//! runtime's HTTP tool. This is a protocol contract, not a style choice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::incidentllm::error::{PlatformError, Result};

/// Connector key identifying a backend variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Native graph traversal protocol, key-based auth.
    #[serde(rename = "cosmosdb-gremlin")]
    Gremlin,
    /// ISO GQL against a REST endpoint, bearer auth.
    #[serde(rename = "fabric-gql")]
    FabricGql,
    /// KQL cluster, telemetry only.
    Kusto,
    /// SQL over a document database, telemetry only.
    #[serde(rename = "cosmosdb-sql")]
    CosmosSql,
    /// Static in-memory data for tests and demo mode.
    Mock,
}

impl BackendKind {
    /// Canonical connector key as it appears in scenario manifests.
    pub fn connector_key(&self) -> &'static str {
        match self {
            BackendKind::Gremlin => "cosmosdb-gremlin",
            BackendKind::FabricGql => "fabric-gql",
            BackendKind::Kusto => "kusto",
            BackendKind::CosmosSql => "cosmosdb-sql",
            BackendKind::Mock => "mock",
        }
    }

    /// Last hyphen segment of the connector key; selects the
    /// language-specific prompt fragment (`language_gremlin`, ...).
    pub fn language_key(&self) -> &'static str {
        let key = self.connector_key();
        key.rsplit('-').next().unwrap_or(key)
    }

    /// Human description substituted into generated openapi specs.
    pub fn query_language_description(&self) -> &'static str {
        match self {
            BackendKind::Gremlin => "Gremlin graph traversal language",
            BackendKind::FabricGql => "ISO GQL graph query language",
            BackendKind::Kusto => "Kusto Query Language (KQL)",
            BackendKind::CosmosSql => "SQL for document queries",
            BackendKind::Mock => "natural-language queries against canned demo data",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.connector_key())
    }
}

impl FromStr for BackendKind {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosmosdb-gremlin" | "gremlin" => Ok(BackendKind::Gremlin),
            "fabric-gql" | "gql" => Ok(BackendKind::FabricGql),
            "kusto" | "kql" => Ok(BackendKind::Kusto),
            "cosmosdb-sql" | "cosmos-sql" | "sql" => Ok(BackendKind::CosmosSql),
            "mock" => Ok(BackendKind::Mock),
            other => Err(PlatformError::validation(format!(
                "unknown connector '{}'",
                other
            ))),
        }
    }
}

/// Routing fields a backend needs to address the right resources.
#[derive(Debug, Clone)]
pub struct QueryScope {
    pub graph_name: String,
    pub graph_database: String,
    pub telemetry_database: String,
    /// Telemetry container when the query targets a specific one.
    pub container: Option<String>,
}

/// Result of a query. `error` is set instead of returning `Err` so the
/// message reaches the LLM through a 200 response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryOutcome {
    pub columns: Vec<String>,
    pub data: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn rows(columns: Vec<String>, data: Vec<serde_json::Value>) -> Self {
        Self {
            columns,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            columns: Vec::new(),
            data: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Counts and labels accompanying a topology response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyMeta {
    pub node_count: usize,
    pub edge_count: usize,
    pub labels: Vec<String>,
}

/// Full topology for visualisation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyOutcome {
    pub nodes: Vec<serde_json::Value>,
    pub edges: Vec<serde_json::Value>,
    pub meta: TopologyMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TopologyOutcome {
    pub fn of(nodes: Vec<serde_json::Value>, edges: Vec<serde_json::Value>) -> Self {
        let mut labels: Vec<String> = nodes
            .iter()
            .filter_map(|n| n.get("label").and_then(|l| l.as_str()))
            .map(str::to_string)
            .collect();
        labels.sort();
        labels.dedup();
        let meta = TopologyMeta {
            node_count: nodes.len(),
            edge_count: edges.len(),
            labels,
        };
        Self {
            nodes,
            edges,
            meta,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A vertex row destined for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphVertex {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// An edge row destined for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub label: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Counts reported after an ingest run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestReport {
    pub vertices: usize,
    pub edges: usize,
}

/// Callback invoked with (phase, done, total) as ingest progresses.
pub type IngestProgress = Arc<dyn Fn(&str, usize, usize) + Send + Sync>;

/// Options for [`GraphBackend::ingest`].
pub struct IngestOptions {
    pub graph_name: String,
    pub graph_database: String,
    /// Drop existing vertices/edges before loading.
    pub drop_first: bool,
    pub progress: Option<IngestProgress>,
}

impl IngestOptions {
    pub fn report(&self, phase: &str, done: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(phase, done, total);
        }
    }
}

/// Common protocol implemented by every backend variant.
#[async_trait]
pub trait GraphBackend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Execute a query in the backend's native language. Backend failures
    /// come back inside the outcome, never as `Err`.
    async fn execute_query(&self, query: &str, scope: &QueryScope) -> QueryOutcome;

    /// Return topology for visualisation. `query` overrides the default
    /// full-graph traversal; `vertex_labels` restricts the node set.
    async fn get_topology(
        &self,
        query: Option<&str>,
        vertex_labels: Option<&[String]>,
        scope: &QueryScope,
    ) -> TopologyOutcome;

    /// Load vertices and edges. Backends whose data is loaded externally
    /// (KQL, document SQL) return `not_supported`.
    async fn ingest(
        &self,
        vertices: Vec<GraphVertex>,
        edges: Vec<GraphEdge>,
        options: &IngestOptions,
    ) -> Result<IngestReport>;

    /// Idempotent resource release, serialized against in-flight queries.
    async fn close(&self) -> Result<()>;
}

/// Close/query serialization helper shared by the backend variants.
///
/// Queries hold a read guard for their duration; `close` takes the write
/// guard, so it waits for in-flight queries and later queries observe the
/// closed flag instead of touching a torn-down client.
#[derive(Debug)]
pub struct LifecycleGate {
    closed: RwLock<bool>,
}

impl LifecycleGate {
    pub fn new() -> Self {
        Self {
            closed: RwLock::new(false),
        }
    }

    /// Acquire the in-flight guard. Errors once the backend is closed.
    pub async fn enter(&self) -> Result<tokio::sync::RwLockReadGuard<'_, bool>> {
        let guard = self.closed.read().await;
        if *guard {
            Err(PlatformError::internal("backend is closed"))
        } else {
            Ok(guard)
        }
    }

    /// Mark closed, waiting for in-flight queries to finish first.
    pub async fn close(&self) {
        let mut guard = self.closed.write().await;
        *guard = true;
    }
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_keys_round_trip() {
        for kind in [
            BackendKind::Gremlin,
            BackendKind::FabricGql,
            BackendKind::Kusto,
            BackendKind::CosmosSql,
            BackendKind::Mock,
        ] {
            let parsed: BackendKind = kind.connector_key().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn language_key_is_last_hyphen_segment() {
        assert_eq!(BackendKind::Gremlin.language_key(), "gremlin");
        assert_eq!(BackendKind::FabricGql.language_key(), "gql");
        assert_eq!(BackendKind::Mock.language_key(), "mock");
    }

    #[test]
    fn unknown_connector_is_validation_error() {
        let err = "neo4j".parse::<BackendKind>().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn topology_meta_collects_labels() {
        let topology = TopologyOutcome::of(
            vec![
                serde_json::json!({"id": "a", "label": "Router"}),
                serde_json::json!({"id": "b", "label": "Link"}),
                serde_json::json!({"id": "c", "label": "Router"}),
            ],
            vec![serde_json::json!({"id": "e1", "source": "a", "target": "b"})],
        );
        assert_eq!(topology.meta.node_count, 3);
        assert_eq!(topology.meta.edge_count, 1);
        assert_eq!(topology.meta.labels, vec!["Link", "Router"]);
    }

    #[tokio::test]
    async fn lifecycle_gate_rejects_after_close() {
        let gate = LifecycleGate::new();
        {
            let _guard = gate.enter().await.unwrap();
        }
        gate.close().await;
        assert!(gate.enter().await.is_err());
    }
}
