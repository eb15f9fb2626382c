//! Static in-memory backend for offline tests and demo mode.
//!
//! Pattern-matches natural-language queries to canned results so the demo
//! scenario works with no external stores at all. Data comes from the
//! built-in network fixture, from CSV, or from the ingestion pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use tokio::sync::Mutex;

use crate::incidentllm::backend::{
    BackendKind, GraphBackend, GraphEdge, GraphVertex, IngestOptions, IngestReport, LifecycleGate,
    QueryOutcome, QueryScope, TopologyOutcome,
};
use crate::incidentllm::error::{PlatformError, Result};

#[derive(Debug)]
struct MockData {
    vertices: Vec<GraphVertex>,
    edges: Vec<GraphEdge>,
    telemetry: HashMap<String, Vec<serde_json::Value>>,
}

/// In-memory graph/telemetry backend.
#[derive(Debug)]
pub struct MockBackend {
    data: Mutex<MockData>,
    gate: LifecycleGate,
}

fn prop(value: &str) -> serde_json::Value {
    serde_json::Value::String(value.to_string())
}

fn fixture() -> MockData {
    let mut vertices = Vec::new();
    let mut edges = Vec::new();

    let routers = [
        ("RTR-SYD-01", "Sydney"),
        ("RTR-MEL-01", "Melbourne"),
        ("RTR-BNE-01", "Brisbane"),
    ];
    for (id, city) in routers {
        vertices.push(GraphVertex {
            id: id.to_string(),
            label: "Router".to_string(),
            properties: HashMap::from([
                ("city".to_string(), prop(city)),
                ("status".to_string(), prop("healthy")),
            ]),
        });
    }
    vertices.push(GraphVertex {
        id: "LINK-SYD-MEL-FIBRE-01".to_string(),
        label: "Link".to_string(),
        properties: HashMap::from([
            ("status".to_string(), prop("down")),
            ("capacity_gbps".to_string(), serde_json::json!(100)),
        ]),
    });

    edges.push(GraphEdge {
        id: "e-syd-link".to_string(),
        label: "connects".to_string(),
        source: "RTR-SYD-01".to_string(),
        target: "LINK-SYD-MEL-FIBRE-01".to_string(),
        properties: HashMap::new(),
    });
    edges.push(GraphEdge {
        id: "e-link-mel".to_string(),
        label: "connects".to_string(),
        source: "LINK-SYD-MEL-FIBRE-01".to_string(),
        target: "RTR-MEL-01".to_string(),
        properties: HashMap::new(),
    });
    edges.push(GraphEdge {
        id: "e-syd-bne".to_string(),
        label: "peers_with".to_string(),
        source: "RTR-SYD-01".to_string(),
        target: "RTR-BNE-01".to_string(),
        properties: HashMap::new(),
    });

    let telemetry = HashMap::from([(
        "interface_counters".to_string(),
        vec![
            serde_json::json!({
                "device": "RTR-SYD-01", "interface": "et-0/0/1",
                "errors_in": 0, "errors_out": 48231,
            }),
            serde_json::json!({
                "device": "RTR-MEL-01", "interface": "et-0/0/4",
                "errors_in": 51022, "errors_out": 3,
            }),
        ],
    )]);

    MockData {
        vertices,
        edges,
        telemetry,
    }
}

impl MockBackend {
    /// Backend preloaded with the built-in network fixture.
    pub fn with_fixture() -> Self {
        Self {
            data: Mutex::new(fixture()),
            gate: LifecycleGate::new(),
        }
    }

    /// Empty backend; data arrives through [`GraphBackend::ingest`].
    pub fn empty() -> Self {
        Self {
            data: Mutex::new(MockData {
                vertices: Vec::new(),
                edges: Vec::new(),
                telemetry: HashMap::new(),
            }),
            gate: LifecycleGate::new(),
        }
    }

    /// Load vertices and edges from CSV. The vertex file needs `id,label`
    /// columns, the edge file `id,label,source,target`; remaining columns
    /// become properties.
    pub fn from_csv(vertices_csv: impl Read, edges_csv: impl Read) -> Result<Self> {
        let vertices = read_vertex_csv(vertices_csv)?;
        let edges = read_edge_csv(edges_csv)?;
        Ok(Self {
            data: Mutex::new(MockData {
                vertices,
                edges,
                telemetry: HashMap::new(),
            }),
            gate: LifecycleGate::new(),
        })
    }
}

fn read_vertex_csv(reader: impl Read) -> Result<Vec<GraphVertex>> {
    let mut out = Vec::new();
    let mut csv_reader = csv::Reader::from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| PlatformError::validation(format!("vertex CSV header: {}", e)))?
        .clone();
    for record in csv_reader.records() {
        let record = record.map_err(|e| PlatformError::validation(format!("vertex CSV: {}", e)))?;
        let mut id = None;
        let mut label = None;
        let mut properties = HashMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            match header {
                "id" => id = Some(field.to_string()),
                "label" => label = Some(field.to_string()),
                _ => {
                    properties.insert(header.to_string(), prop(field));
                }
            }
        }
        out.push(GraphVertex {
            id: id.ok_or_else(|| PlatformError::validation("vertex CSV is missing 'id'"))?,
            label: label.ok_or_else(|| PlatformError::validation("vertex CSV is missing 'label'"))?,
            properties,
        });
    }
    Ok(out)
}

fn read_edge_csv(reader: impl Read) -> Result<Vec<GraphEdge>> {
    let mut out = Vec::new();
    let mut csv_reader = csv::Reader::from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| PlatformError::validation(format!("edge CSV header: {}", e)))?
        .clone();
    for record in csv_reader.records() {
        let record = record.map_err(|e| PlatformError::validation(format!("edge CSV: {}", e)))?;
        let mut fields: HashMap<&str, String> = HashMap::new();
        let mut properties = HashMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            match header {
                "id" | "label" | "source" | "target" => {
                    fields.insert(header, field.to_string());
                }
                _ => {
                    properties.insert(header.to_string(), prop(field));
                }
            }
        }
        let take = |key: &str| -> Result<String> {
            fields
                .get(key)
                .cloned()
                .ok_or_else(|| PlatformError::validation(format!("edge CSV is missing '{}'", key)))
        };
        out.push(GraphEdge {
            id: take("id")?,
            label: take("label")?,
            source: take("source")?,
            target: take("target")?,
            properties,
        });
    }
    Ok(out)
}

fn vertex_json(vertex: &GraphVertex) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert("id".to_string(), prop(&vertex.id));
    object.insert("label".to_string(), prop(&vertex.label));
    for (key, value) in &vertex.properties {
        object.insert(key.clone(), value.clone());
    }
    serde_json::Value::Object(object)
}

fn edge_json(edge: &GraphEdge) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert("id".to_string(), prop(&edge.id));
    object.insert("label".to_string(), prop(&edge.label));
    object.insert("source".to_string(), prop(&edge.source));
    object.insert("target".to_string(), prop(&edge.target));
    for (key, value) in &edge.properties {
        object.insert(key.clone(), value.clone());
    }
    serde_json::Value::Object(object)
}

#[async_trait]
impl GraphBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    async fn execute_query(&self, query: &str, scope: &QueryScope) -> QueryOutcome {
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(e) => return QueryOutcome::failed(e.to_string()),
        };
        let data = self.data.lock().await;
        let lowered = query.to_lowercase();

        // Telemetry-style questions route to the telemetry rows.
        if let Some(container) = &scope.container {
            if let Some(rows) = data.telemetry.get(container) {
                return QueryOutcome::rows(vec!["row".to_string()], rows.clone());
            }
        }
        if lowered.contains("error") || lowered.contains("counter") || lowered.contains("telemetry")
        {
            let rows: Vec<serde_json::Value> = data
                .telemetry
                .values()
                .flat_map(|rows| rows.iter().cloned())
                .collect();
            return QueryOutcome::rows(vec!["row".to_string()], rows);
        }

        if lowered.contains("count") {
            return QueryOutcome::rows(
                vec!["vertices".to_string(), "edges".to_string()],
                vec![serde_json::json!([data.vertices.len(), data.edges.len()])],
            );
        }

        if lowered.contains("down") || lowered.contains("status") {
            let rows: Vec<serde_json::Value> = data
                .vertices
                .iter()
                .filter(|v| v.properties.get("status") == Some(&prop("down")))
                .map(vertex_json)
                .collect();
            return QueryOutcome::rows(vec!["vertex".to_string()], rows);
        }

        if lowered.contains("neighbor") || lowered.contains("connected") {
            // Find the first vertex id mentioned in the query, then walk
            // its incident edges.
            if let Some(focus) = data
                .vertices
                .iter()
                .find(|v| lowered.contains(&v.id.to_lowercase()))
            {
                let neighbors: Vec<serde_json::Value> = data
                    .edges
                    .iter()
                    .filter_map(|e| {
                        if e.source == focus.id {
                            Some(prop(&e.target))
                        } else if e.target == focus.id {
                            Some(prop(&e.source))
                        } else {
                            None
                        }
                    })
                    .collect();
                return QueryOutcome::rows(vec!["neighbor".to_string()], neighbors);
            }
            return QueryOutcome::failed(format!(
                "no vertex mentioned in query '{}' exists in graph '{}'; try listing vertices first",
                query, scope.graph_name
            ));
        }

        // Default: list every vertex.
        let rows: Vec<serde_json::Value> = data.vertices.iter().map(vertex_json).collect();
        QueryOutcome::rows(vec!["vertex".to_string()], rows)
    }

    async fn get_topology(
        &self,
        _query: Option<&str>,
        vertex_labels: Option<&[String]>,
        _scope: &QueryScope,
    ) -> TopologyOutcome {
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(e) => return TopologyOutcome::failed(e.to_string()),
        };
        let data = self.data.lock().await;
        let nodes: Vec<serde_json::Value> = data
            .vertices
            .iter()
            .filter(|v| {
                vertex_labels
                    .map(|labels| labels.iter().any(|l| l == &v.label))
                    .unwrap_or(true)
            })
            .map(vertex_json)
            .collect();
        let kept: std::collections::HashSet<&str> = nodes
            .iter()
            .filter_map(|n| n.get("id").and_then(|v| v.as_str()))
            .collect();
        let edges: Vec<serde_json::Value> = data
            .edges
            .iter()
            .filter(|e| kept.contains(e.source.as_str()) && kept.contains(e.target.as_str()))
            .map(edge_json)
            .collect();
        TopologyOutcome::of(nodes, edges)
    }

    async fn ingest(
        &self,
        vertices: Vec<GraphVertex>,
        edges: Vec<GraphEdge>,
        options: &IngestOptions,
    ) -> Result<IngestReport> {
        let _guard = self.gate.enter().await?;
        let mut data = self.data.lock().await;
        if options.drop_first {
            data.vertices.clear();
            data.edges.clear();
        }
        let vertex_total = vertices.len();
        for (index, vertex) in vertices.into_iter().enumerate() {
            data.vertices.retain(|v| v.id != vertex.id);
            data.vertices.push(vertex);
            if (index + 1) % 100 == 0 {
                options.report("vertices", index + 1, vertex_total);
            }
        }
        options.report("vertices", vertex_total, vertex_total);

        let edge_total = edges.len();
        for (index, edge) in edges.into_iter().enumerate() {
            data.edges.retain(|e| e.id != edge.id);
            data.edges.push(edge);
            if (index + 1) % 100 == 0 {
                options.report("edges", index + 1, edge_total);
            }
        }
        options.report("edges", edge_total, edge_total);

        Ok(IngestReport {
            vertices: vertex_total,
            edges: edge_total,
        })
    }

    async fn close(&self) -> Result<()> {
        self.gate.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> QueryScope {
        QueryScope {
            graph_name: "demo-topology".to_string(),
            graph_database: "graphdb".to_string(),
            telemetry_database: "telemetry".to_string(),
            container: None,
        }
    }

    #[tokio::test]
    async fn fixture_answers_status_queries() {
        let backend = MockBackend::with_fixture();
        let outcome = backend
            .execute_query("which links are down right now?", &scope())
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.data.len(), 1);
        assert_eq!(outcome.data[0]["id"], "LINK-SYD-MEL-FIBRE-01");
    }

    #[tokio::test]
    async fn neighbor_queries_walk_edges() {
        let backend = MockBackend::with_fixture();
        let outcome = backend
            .execute_query("what is connected to LINK-SYD-MEL-FIBRE-01?", &scope())
            .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.data.len(), 2);
    }

    #[tokio::test]
    async fn unknown_vertex_mentions_return_readable_error() {
        let backend = MockBackend::with_fixture();
        let outcome = backend
            .execute_query("neighbors of LINK-DOES-NOT-EXIST", &scope())
            .await;
        let error = outcome.error.expect("expected in-body error");
        assert!(error.contains("try listing vertices"));
    }

    #[tokio::test]
    async fn topology_filters_by_label_and_prunes_edges() {
        let backend = MockBackend::with_fixture();
        let labels = vec!["Router".to_string()];
        let topology = backend.get_topology(None, Some(&labels), &scope()).await;
        assert_eq!(topology.meta.node_count, 3);
        // Only the router-to-router peering edge survives.
        assert_eq!(topology.meta.edge_count, 1);
        assert_eq!(topology.meta.labels, vec!["Router"]);
    }

    #[tokio::test]
    async fn ingest_upserts_and_reports_progress() {
        let backend = MockBackend::empty();
        let report = backend
            .ingest(
                vec![GraphVertex {
                    id: "n1".to_string(),
                    label: "Switch".to_string(),
                    properties: HashMap::new(),
                }],
                vec![],
                &IngestOptions {
                    graph_name: "g".to_string(),
                    graph_database: "db".to_string(),
                    drop_first: false,
                    progress: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(report.vertices, 1);

        let topology = backend.get_topology(None, None, &scope()).await;
        assert_eq!(topology.meta.node_count, 1);
    }

    #[tokio::test]
    async fn csv_loading_maps_extra_columns_to_properties() {
        let vertices = "id,label,region\nn1,Router,apac\n";
        let edges = "id,label,source,target\ne1,connects,n1,n1\n";
        let backend = MockBackend::from_csv(vertices.as_bytes(), edges.as_bytes()).unwrap();
        let topology = backend.get_topology(None, None, &scope()).await;
        assert_eq!(topology.nodes[0]["region"], "apac");
    }

    #[tokio::test]
    async fn closed_backend_reports_error_in_body() {
        let backend = MockBackend::with_fixture();
        backend.close().await.unwrap();
        let outcome = backend.execute_query("anything", &scope()).await;
        assert!(outcome.error.is_some());
    }
}
