//! Native graph backend speaking the Gremlin wire protocol over
//! websocket/TLS.
//!
//! Auth is key-based SASL PLAIN with `/dbs/{database}/colls/{graph}` as the
//! username (the wire protocol does not support federated auth). Rate-limit
//! (429) responses and websocket handshake failures retry up to 3 times
//! with exponential backoff. Each request runs on its own connection:
//! submit the eval frame, answer the server's authentication challenge,
//! then drain partial-content frames until the terminal status.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::incidentllm::backend::{
    BackendKind, GraphBackend, GraphEdge, GraphVertex, IngestOptions, IngestReport, LifecycleGate,
    QueryOutcome, QueryScope, TopologyOutcome,
};
use crate::incidentllm::backends::common::{retry_with_backoff, BackoffPolicy};
use crate::incidentllm::config::GremlinConfig;
use crate::incidentllm::error::{PlatformError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const FRAME_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug)]
pub struct GremlinBackend {
    endpoint: String,
    key: String,
    database: String,
    policy: BackoffPolicy,
    gate: LifecycleGate,
}

impl GremlinBackend {
    pub fn new(config: &GremlinConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| PlatformError::config_missing("GREMLIN_ENDPOINT"))?;
        let key = config
            .key
            .clone()
            .ok_or_else(|| PlatformError::config_missing("GREMLIN_KEY"))?;
        Ok(Self {
            endpoint,
            key,
            database: config.database.clone(),
            policy: BackoffPolicy::default(),
            gate: LifecycleGate::new(),
        })
    }

    /// SASL PLAIN credential: NUL-separated username and key, base64
    /// encoded. The username is the collection path of the graph.
    fn sasl_credential(&self, graph_name: &str) -> String {
        let username = format!("/dbs/{}/colls/{}", self.database, graph_name);
        base64::engine::general_purpose::STANDARD
            .encode(format!("\0{}\0{}", username, self.key))
    }

    async fn submit(&self, traversal: &str, graph_name: &str) -> Result<Vec<Value>> {
        retry_with_backoff(
            &self.policy,
            || {
                let traversal = traversal;
                let graph_name = graph_name;
                async move { self.exchange(traversal, graph_name).await }
            },
            || async {},
        )
        .await
    }

    /// One eval round-trip on a fresh websocket connection.
    async fn exchange(&self, traversal: &str, graph_name: &str) -> Result<Vec<Value>> {
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.endpoint.as_str()))
            .await
            .map_err(|_| PlatformError::upstream("gremlin websocket handshake timed out"))?;
        let (mut ws, _) = connected.map_err(|e| {
            PlatformError::upstream(format!("gremlin websocket handshake failed: {}", e))
        })?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let request = eval_frame(&request_id, traversal);
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| PlatformError::upstream(format!("gremlin request send failed: {}", e)))?;

        let mut data = Vec::new();
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, ws.next())
                .await
                .map_err(|_| PlatformError::upstream("gremlin server response timed out"))?
                .ok_or_else(|| {
                    PlatformError::upstream("gremlin server closed the connection mid-response")
                })?
                .map_err(|e| PlatformError::upstream(format!("gremlin frame error: {}", e)))?;

            let payload: Value = match frame {
                Message::Text(text) => serde_json::from_str(&text).map_err(|e| {
                    PlatformError::upstream(format!("malformed gremlin frame: {}", e))
                })?,
                Message::Binary(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                    PlatformError::upstream(format!("malformed gremlin frame: {}", e))
                })?,
                Message::Ping(ping) => {
                    let _ = ws.send(Message::Pong(ping)).await;
                    continue;
                }
                Message::Close(_) => {
                    return Err(PlatformError::upstream(
                        "gremlin server closed the connection mid-response",
                    ))
                }
                _ => continue,
            };

            match frame_disposition(&payload, graph_name)? {
                FrameStep::AuthChallenge => {
                    let auth = auth_frame(&request_id, &self.sasl_credential(graph_name));
                    ws.send(Message::Text(auth.to_string())).await.map_err(|e| {
                        PlatformError::upstream(format!("gremlin auth send failed: {}", e))
                    })?;
                }
                FrameStep::Partial => data.extend(extract_result_data(&payload)),
                FrameStep::Final => {
                    data.extend(extract_result_data(&payload));
                    break;
                }
                FrameStep::Empty => break,
            }
        }
        let _ = ws.send(Message::Close(None)).await;
        Ok(data)
    }
}

fn eval_frame(request_id: &str, traversal: &str) -> Value {
    serde_json::json!({
        "requestId": request_id,
        "op": "eval",
        "processor": "",
        "args": {
            "gremlin": traversal,
            "language": "gremlin-groovy",
        },
    })
}

fn auth_frame(request_id: &str, sasl: &str) -> Value {
    serde_json::json!({
        "requestId": request_id,
        "op": "authentication",
        "processor": "",
        "args": { "sasl": sasl },
    })
}

/// Next protocol step after a response frame.
#[derive(Debug, PartialEq)]
enum FrameStep {
    /// 407: the server wants the SASL credential before evaluating.
    AuthChallenge,
    /// 206: partial content, more frames follow.
    Partial,
    /// 200: final frame of the result.
    Final,
    /// 204: the traversal produced nothing.
    Empty,
}

fn status_message(payload: &Value) -> String {
    payload
        .pointer("/status/message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Map the frame's status code onto the next step, or classify the failure.
fn frame_disposition(payload: &Value, graph_name: &str) -> Result<FrameStep> {
    let code = payload
        .pointer("/status/code")
        .and_then(Value::as_u64)
        .unwrap_or(500);
    match code {
        200 => Ok(FrameStep::Final),
        206 => Ok(FrameStep::Partial),
        204 => Ok(FrameStep::Empty),
        407 => Ok(FrameStep::AuthChallenge),
        401 | 403 => Err(PlatformError::auth("gremlin server rejected account key")),
        404 => Err(PlatformError::resource_not_found(format!(
            "graph '{}' does not exist",
            graph_name
        ))),
        429 => Err(PlatformError::rate_limit("gremlin server throttled request")),
        597 => Err(PlatformError::query_syntax(status_message(payload))),
        598 => Err(PlatformError::upstream("gremlin server evaluation timed out")),
        code if code >= 500 => Err(PlatformError::upstream(format!(
            "gremlin server returned status {}: {}",
            code,
            status_message(payload)
        ))),
        code => Err(PlatformError::query_syntax(format!(
            "gremlin server returned status {}: {}",
            code,
            status_message(payload)
        ))),
    }
}

/// Gremlin server wraps results either as a bare array or as a typed
/// `{"@type": "g:List", "@value": [...]}` envelope.
fn extract_result_data(payload: &Value) -> Vec<Value> {
    let data = payload.pointer("/result/data");
    match data {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map
            .get("@value")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl GraphBackend for GremlinBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gremlin
    }

    async fn execute_query(&self, query: &str, scope: &QueryScope) -> QueryOutcome {
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(e) => return QueryOutcome::failed(e.to_string()),
        };
        match self.submit(query, &scope.graph_name).await {
            Ok(data) => QueryOutcome::rows(vec!["result".to_string()], data),
            Err(e) => QueryOutcome::failed(e.to_string()),
        }
    }

    async fn get_topology(
        &self,
        query: Option<&str>,
        vertex_labels: Option<&[String]>,
        scope: &QueryScope,
    ) -> TopologyOutcome {
        let _guard = match self.gate.enter().await {
            Ok(guard) => guard,
            Err(e) => return TopologyOutcome::failed(e.to_string()),
        };

        let vertex_query = match (query, vertex_labels) {
            (Some(custom), _) => custom.to_string(),
            (None, Some(labels)) if !labels.is_empty() => {
                let list = labels
                    .iter()
                    .map(|l| format!("'{}'", escape(l)))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("g.V().hasLabel({}).valueMap(true)", list)
            }
            _ => "g.V().valueMap(true)".to_string(),
        };

        let nodes = match self.submit(&vertex_query, &scope.graph_name).await {
            Ok(data) => data.into_iter().map(flatten_value_map).collect::<Vec<_>>(),
            Err(e) => return TopologyOutcome::failed(e.to_string()),
        };
        let edges = match self
            .submit(
                "g.E().project('id','label','source','target').by(id).by(label).by(outV().id()).by(inV().id())",
                &scope.graph_name,
            )
            .await
        {
            Ok(data) => data,
            Err(e) => return TopologyOutcome::failed(e.to_string()),
        };
        TopologyOutcome::of(nodes, edges)
    }

    async fn ingest(
        &self,
        vertices: Vec<GraphVertex>,
        edges: Vec<GraphEdge>,
        options: &IngestOptions,
    ) -> Result<IngestReport> {
        let _guard = self.gate.enter().await?;
        let graph_name = &options.graph_name;

        if options.drop_first {
            self.submit("g.V().drop()", graph_name).await?;
        }

        let vertex_total = vertices.len();
        for (index, vertex) in vertices.iter().enumerate() {
            let mut traversal = format!(
                "g.addV('{}').property('id','{}')",
                escape(&vertex.label),
                escape(&vertex.id)
            );
            for (key, value) in &vertex.properties {
                traversal.push_str(&format!(
                    ".property('{}','{}')",
                    escape(key),
                    escape(&value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()))
                ));
            }
            self.submit(&traversal, graph_name).await?;
            if (index + 1) % 100 == 0 {
                options.report("vertices", index + 1, vertex_total);
            }
        }
        options.report("vertices", vertex_total, vertex_total);

        let edge_total = edges.len();
        for (index, edge) in edges.iter().enumerate() {
            let traversal = format!(
                "g.V('{}').addE('{}').to(g.V('{}')).property('id','{}')",
                escape(&edge.source),
                escape(&edge.label),
                escape(&edge.target),
                escape(&edge.id)
            );
            self.submit(&traversal, graph_name).await?;
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

/// `valueMap(true)` returns property values as single-element arrays; the
/// topology contract wants scalars.
fn flatten_value_map(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let flattened = map
                .into_iter()
                .map(|(key, value)| match value {
                    Value::Array(items) if items.len() == 1 => {
                        (key, items.into_iter().next().unwrap_or(Value::Null))
                    }
                    other => (key, other),
                })
                .collect();
            Value::Object(flattened)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> GremlinBackend {
        GremlinBackend::new(&GremlinConfig {
            endpoint: Some("wss://localhost:443/gremlin".to_string()),
            key: Some("account-key".to_string()),
            database: "graphdb".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn eval_frame_carries_traversal_and_request_id() {
        let frame = eval_frame("req-1", "g.V().count()");
        assert_eq!(frame["requestId"], "req-1");
        assert_eq!(frame["op"], "eval");
        assert_eq!(frame["args"]["gremlin"], "g.V().count()");
        assert_eq!(frame["args"]["language"], "gremlin-groovy");
    }

    #[test]
    fn sasl_credential_is_nul_separated_collection_path_and_key() {
        let sasl = backend().sasl_credential("demo-topology");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(sasl)
            .unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "\0/dbs/graphdb/colls/demo-topology\0account-key"
        );

        let frame = auth_frame("req-1", "c2FzbA==");
        assert_eq!(frame["op"], "authentication");
        assert_eq!(frame["args"]["sasl"], "c2FzbA==");
    }

    #[test]
    fn frame_disposition_follows_the_protocol() {
        let frame = |code: u64| serde_json::json!({"status": {"code": code, "message": "m"}});
        assert_eq!(
            frame_disposition(&frame(200), "g").unwrap(),
            FrameStep::Final
        );
        assert_eq!(
            frame_disposition(&frame(206), "g").unwrap(),
            FrameStep::Partial
        );
        assert_eq!(
            frame_disposition(&frame(204), "g").unwrap(),
            FrameStep::Empty
        );
        assert_eq!(
            frame_disposition(&frame(407), "g").unwrap(),
            FrameStep::AuthChallenge
        );
    }

    #[test]
    fn throttling_is_retryable_but_bad_scripts_are_not() {
        let frame = |code: u64| serde_json::json!({"status": {"code": code, "message": "m"}});
        let throttled = frame_disposition(&frame(429), "g").unwrap_err();
        assert!(throttled.is_retryable());

        let bad_script = frame_disposition(&frame(597), "g").unwrap_err();
        assert_eq!(bad_script.kind(), "query_syntax");
        assert!(!bad_script.is_retryable());

        let missing = frame_disposition(&frame(404), "demo-topology").unwrap_err();
        assert!(missing.to_string().contains("demo-topology"));
    }

    #[test]
    fn extracts_bare_array_results() {
        let payload = serde_json::json!({"result": {"data": [1, 2, 3]}});
        assert_eq!(extract_result_data(&payload).len(), 3);
    }

    #[test]
    fn extracts_typed_list_results() {
        let payload = serde_json::json!({
            "result": {"data": {"@type": "g:List", "@value": [{"id": "a"}]}}
        });
        let data = extract_result_data(&payload);
        assert_eq!(data[0]["id"], "a");
    }

    #[test]
    fn flatten_unwraps_single_element_arrays() {
        let flattened = flatten_value_map(serde_json::json!({
            "id": "n1", "status": ["down"], "tags": ["a", "b"]
        }));
        assert_eq!(flattened["status"], "down");
        assert_eq!(flattened["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn escape_quotes_in_traversals() {
        assert_eq!(escape("O'Brien"), "O\\'Brien");
    }

    #[test]
    fn missing_config_is_config_missing() {
        let err = GremlinBackend::new(&GremlinConfig::default()).unwrap_err();
        assert_eq!(err.kind(), "config_missing");
    }
}
