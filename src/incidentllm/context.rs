//! Scenario context resolution.
//!
//! Every query request carries an `X-Graph` routing header. The resolver
//! maps that header to an immutable [`ScenarioContext`] carrying the
//! routing fields the dispatch layer needs. The context is created per
//! request and never persisted or shared across requests.
//!
//! Resolution never fails: when the config store is unreachable the context
//! falls back to the process-default backend and the downstream backend
//! reports a clear error at query time. Returning an error here would take
//! every unrelated endpoint down with the config store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::incidentllm::backend::{BackendKind, QueryScope};
use crate::incidentllm::config::PlatformConfig;
use crate::incidentllm::store::{DocumentStore, SCENARIO_CONFIGS_CONTAINER};

/// Routing header carrying the graph identifier.
pub const GRAPH_HEADER: &str = "x-graph";

/// Per-request routing record derived from the `X-Graph` header.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub graph_name: String,
    pub graph_database: String,
    pub telemetry_database: String,
    /// Telemetry containers are named `{prefix}-{container}`.
    pub telemetry_container_prefix: String,
    pub prompts_database: String,
    /// Prompt documents for this scenario live under this scenario key.
    pub prompts_scenario: String,
    pub backend_type: BackendKind,
}

impl ScenarioContext {
    /// Context for the process-default scenario, used when no header is
    /// present and by startup wiring.
    pub fn default_for(config: &PlatformConfig) -> Self {
        let graph_name = config.default_graph_name();
        let prefix = scenario_prefix(&graph_name).to_string();
        Self {
            graph_name,
            graph_database: config.gremlin.database.clone(),
            telemetry_database: config.kusto.database.clone(),
            telemetry_container_prefix: prefix.clone(),
            prompts_database: config.cosmos.database.clone(),
            prompts_scenario: prefix,
            backend_type: config.default_backend,
        }
    }

    /// Routing fields handed to the backend for a query.
    pub fn query_scope(&self, container: Option<String>) -> QueryScope {
        QueryScope {
            graph_name: self.graph_name.clone(),
            graph_database: self.graph_database.clone(),
            telemetry_database: self.telemetry_database.clone(),
            container: container
                .map(|c| format!("{}-{}", self.telemetry_container_prefix, c)),
        }
    }
}

/// Scenario prefix of a graph name: everything before the last hyphen.
/// `"foo-topology"` resolves to `"foo"`; a name without hyphens is its own
/// prefix. The ingestion pipeline MUST use the matching `-topology` suffix
/// when it names graphs, or uploaded data becomes unreachable here.
pub fn scenario_prefix(graph_name: &str) -> &str {
    match graph_name.rsplit_once('-') {
        Some((prefix, _)) => prefix,
        None => graph_name,
    }
}

struct CachedKind {
    kind: BackendKind,
    fetched_at: Instant,
}

/// Maps routing headers to scenario contexts, with a short-TTL cache on the
/// per-scenario connector lookup.
pub struct ContextResolver {
    config: PlatformConfig,
    store: Arc<dyn DocumentStore>,
    cache: Mutex<HashMap<String, CachedKind>>,
    ttl: Duration,
}

impl ContextResolver {
    pub fn new(config: PlatformConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config,
            store,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(5),
        }
    }

    /// Resolve the context for a request. `graph_header` is the raw
    /// `X-Graph` value when present.
    pub async fn resolve(&self, graph_header: Option<&str>) -> ScenarioContext {
        let graph_name = graph_header
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_graph_name());
        let prefix = scenario_prefix(&graph_name).to_string();
        let backend_type = self.connector_for(&prefix).await;

        ScenarioContext {
            graph_name,
            graph_database: self.config.gremlin.database.clone(),
            telemetry_database: match backend_type {
                BackendKind::Kusto => self.config.kusto.database.clone(),
                _ => self.config.cosmos.database.clone(),
            },
            telemetry_container_prefix: prefix.clone(),
            prompts_database: self.config.cosmos.database.clone(),
            prompts_scenario: prefix,
            backend_type,
        }
    }

    async fn connector_for(&self, prefix: &str) -> BackendKind {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(prefix) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return cached.kind;
                }
            }
        }

        let kind = match self.store.get(SCENARIO_CONFIGS_CONTAINER, prefix).await {
            Ok(Some(doc)) => doc
                .pointer("/data_sources/graph/connector")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<BackendKind>().ok())
                .unwrap_or(self.config.default_backend),
            Ok(None) => self.config.default_backend,
            Err(e) => {
                log::debug!(
                    "scenario config lookup for '{}' failed ({}); using default backend",
                    prefix,
                    e
                );
                self.config.default_backend
            }
        };

        self.cache.lock().await.insert(
            prefix.to_string(),
            CachedKind {
                kind,
                fetched_at: Instant::now(),
            },
        );
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidentllm::store::MemoryStore;

    #[test]
    fn prefix_splits_on_last_hyphen() {
        assert_eq!(scenario_prefix("telco-noc-topology"), "telco-noc");
        assert_eq!(scenario_prefix("foo-topology"), "foo");
        assert_eq!(scenario_prefix("nohyphen"), "nohyphen");
    }

    #[tokio::test]
    async fn missing_header_falls_back_to_default_graph() {
        let resolver = ContextResolver::new(
            PlatformConfig::default(),
            Arc::new(MemoryStore::new()),
        );
        let context = resolver.resolve(None).await;
        assert_eq!(context.graph_name, "demo-topology");
        assert_eq!(context.backend_type, BackendKind::Mock);
    }

    #[tokio::test]
    async fn connector_comes_from_scenario_config() {
        let store = Arc::new(MemoryStore::new());
        store
            .ensure_container(SCENARIO_CONFIGS_CONTAINER)
            .await
            .unwrap();
        store
            .upsert(
                SCENARIO_CONFIGS_CONTAINER,
                serde_json::json!({
                    "id": "telco-noc",
                    "scenario_name": "telco-noc",
                    "data_sources": {"graph": {"connector": "fabric-gql"}},
                }),
            )
            .await
            .unwrap();

        let resolver = ContextResolver::new(PlatformConfig::default(), store);
        let context = resolver.resolve(Some("telco-noc-topology")).await;
        assert_eq!(context.backend_type, BackendKind::FabricGql);
        assert_eq!(context.telemetry_container_prefix, "telco-noc");
    }

    #[tokio::test]
    async fn store_failure_degrades_to_default_backend() {
        // Fresh MemoryStore has no config container, so the lookup errors.
        let resolver = ContextResolver::new(
            PlatformConfig::default(),
            Arc::new(MemoryStore::new()),
        );
        let context = resolver.resolve(Some("mystery-topology")).await;
        assert_eq!(context.backend_type, BackendKind::Mock);
    }

    #[tokio::test]
    async fn query_scope_prefixes_telemetry_container() {
        let resolver = ContextResolver::new(
            PlatformConfig::default(),
            Arc::new(MemoryStore::new()),
        );
        let context = resolver.resolve(Some("telco-noc-topology")).await;
        let scope = context.query_scope(Some("interface_counters".to_string()));
        assert_eq!(
            scope.container.as_deref(),
            Some("telco-noc-interface_counters")
        );
    }
}
