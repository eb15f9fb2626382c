//! Runtime configuration for the platform.
//!
//! All configuration is read from environment variables once at startup via
//! [`PlatformConfig::from_env`]. Missing variables for a selected backend are
//! logged as warnings and the affected backend fails at query time with a
//! clear [`config_missing`](crate::error::PlatformError::ConfigMissing)
//! error. The process keeps running so the remaining backends stay usable.
//!
//! # Example
//!
//! ```rust
//! use incidentllm::config::PlatformConfig;
//!
//! let config = PlatformConfig::default();
//! assert_eq!(config.default_graph_name(), "demo-topology");
//! assert_eq!(config.default_backend, incidentllm::backend::BackendKind::Mock);
//! ```

use std::env;
use std::time::Duration;

use crate::incidentllm::backend::BackendKind;

/// Connection settings for the native graph backend.
#[derive(Debug, Clone, Default)]
pub struct GremlinConfig {
    /// HTTP endpoint of the Gremlin server, e.g. `https://host:443/gremlin`.
    pub endpoint: Option<String>,
    /// Account key used for basic auth on the wire protocol. The protocol
    /// does not support federated auth, hence the key.
    pub key: Option<String>,
    /// Database holding the graphs.
    pub database: String,
}

/// Connection settings for the remote GQL backend.
#[derive(Debug, Clone, Default)]
pub struct FabricConfig {
    /// REST endpoint accepting ISO GQL statements.
    pub endpoint: Option<String>,
    /// OAuth scope requested from the credential provider.
    pub scope: String,
}

/// Connection settings for the KQL telemetry backend.
#[derive(Debug, Clone, Default)]
pub struct KustoConfig {
    pub cluster_uri: Option<String>,
    pub database: String,
}

/// Connection settings for the document-SQL telemetry backend and the
/// document store.
#[derive(Debug, Clone, Default)]
pub struct CosmosConfig {
    pub endpoint: Option<String>,
    pub database: String,
}

/// Credential provider settings (client-credentials flow).
#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Hosted agent runtime settings. When either field is absent the bridge
/// substitutes the deterministic stub runtime for local development.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Project endpoint of the hosted agent runtime.
    pub project_endpoint: Option<String>,
    /// Document id of the agent-id map written by the provisioner.
    pub agent_map_id: String,
}

/// Tuning for the SSE substrate.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Per-source ring buffer length replayed to new subscribers.
    pub ring_capacity: usize,
    /// Per-subscriber bounded queue capacity.
    pub queue_capacity: usize,
    /// Idle interval after which a heartbeat event is emitted.
    pub heartbeat: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100,
            queue_capacity: 256,
            heartbeat: Duration::from_secs(15),
        }
    }
}

/// Aggregate platform configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Default scenario name used when no routing header is present.
    pub default_scenario: String,
    /// Backend used when a scenario declares no connector.
    pub default_backend: BackendKind,
    /// Base URL advertised to agent tools, substituted into openapi specs.
    pub public_base_url: String,
    /// Directory of openapi templates and prompt fragments; falls back to
    /// compiled-in defaults when absent.
    pub templates_dir: Option<String>,
    /// Endpoint of the hosted search service backing runbook/ticket
    /// indexes; absent means the in-memory search store.
    pub search_endpoint: Option<String>,
    pub gremlin: GremlinConfig,
    pub fabric: FabricConfig,
    pub kusto: KustoConfig,
    pub cosmos: CosmosConfig,
    pub credentials: CredentialConfig,
    pub runtime: RuntimeConfig,
    pub sse: SseConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            default_scenario: "demo".to_string(),
            default_backend: BackendKind::Mock,
            public_base_url: "http://localhost:8080".to_string(),
            templates_dir: None,
            search_endpoint: None,
            gremlin: GremlinConfig {
                database: "graphdb".to_string(),
                ..Default::default()
            },
            fabric: FabricConfig {
                scope: "https://api.fabric.microsoft.com/.default".to_string(),
                ..Default::default()
            },
            kusto: KustoConfig {
                database: "telemetry".to_string(),
                ..Default::default()
            },
            cosmos: CosmosConfig {
                database: "incidentllm".to_string(),
                ..Default::default()
            },
            credentials: CredentialConfig::default(),
            runtime: RuntimeConfig {
                project_endpoint: None,
                agent_map_id: "agent-id-map".to_string(),
            },
            sse: SseConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Read configuration from the process environment.
    ///
    /// Unknown backend names fall back to [`BackendKind::Mock`] with a
    /// warning so a typo in deployment config degrades to demo mode instead
    /// of crashing the service.
    pub fn from_env() -> Self {
        let mut config = PlatformConfig::default();

        if let Ok(v) = env::var("DEFAULT_SCENARIO") {
            config.default_scenario = v;
        }
        if let Ok(v) = env::var("DEFAULT_BACKEND") {
            match v.parse::<BackendKind>() {
                Ok(kind) => config.default_backend = kind,
                Err(_) => {
                    log::warn!("unknown DEFAULT_BACKEND '{}', falling back to mock", v);
                }
            }
        }
        if let Ok(v) = env::var("PUBLIC_BASE_URL") {
            config.public_base_url = v;
        }
        config.templates_dir = env::var("TEMPLATES_DIR").ok();
        config.search_endpoint = env::var("SEARCH_ENDPOINT").ok();

        config.gremlin.endpoint = env::var("GREMLIN_ENDPOINT").ok();
        config.gremlin.key = env::var("GREMLIN_KEY").ok();
        if let Ok(v) = env::var("GREMLIN_DATABASE") {
            config.gremlin.database = v;
        }

        config.fabric.endpoint = env::var("FABRIC_GQL_ENDPOINT").ok();
        if let Ok(v) = env::var("FABRIC_SCOPE") {
            config.fabric.scope = v;
        }

        config.kusto.cluster_uri = env::var("KUSTO_CLUSTER_URI").ok();
        if let Ok(v) = env::var("KUSTO_DATABASE") {
            config.kusto.database = v;
        }

        config.cosmos.endpoint = env::var("COSMOS_ENDPOINT").ok();
        if let Ok(v) = env::var("COSMOS_DATABASE") {
            config.cosmos.database = v;
        }

        config.credentials.tenant_id = env::var("AUTH_TENANT_ID").ok();
        config.credentials.client_id = env::var("AUTH_CLIENT_ID").ok();
        config.credentials.client_secret = env::var("AUTH_CLIENT_SECRET").ok();

        config.runtime.project_endpoint = env::var("AGENT_RUNTIME_ENDPOINT").ok();
        if let Ok(v) = env::var("AGENT_MAP_ID") {
            config.runtime.agent_map_id = v;
        }

        if let Ok(v) = env::var("SSE_HEARTBEAT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.sse.heartbeat = Duration::from_secs(secs);
            }
        }

        config.warn_missing();
        config
    }

    /// Graph name derived from the default scenario.
    pub fn default_graph_name(&self) -> String {
        format!("{}-topology", self.default_scenario)
    }

    /// Variables that the selected default backend requires but that are
    /// absent. Returned instead of panicking so startup can log and move on.
    pub fn missing_for(&self, kind: BackendKind) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match kind {
            BackendKind::Gremlin => {
                if self.gremlin.endpoint.is_none() {
                    missing.push("GREMLIN_ENDPOINT");
                }
                if self.gremlin.key.is_none() {
                    missing.push("GREMLIN_KEY");
                }
            }
            BackendKind::FabricGql => {
                if self.fabric.endpoint.is_none() {
                    missing.push("FABRIC_GQL_ENDPOINT");
                }
            }
            BackendKind::Kusto => {
                if self.kusto.cluster_uri.is_none() {
                    missing.push("KUSTO_CLUSTER_URI");
                }
            }
            BackendKind::CosmosSql => {
                if self.cosmos.endpoint.is_none() {
                    missing.push("COSMOS_ENDPOINT");
                }
            }
            BackendKind::Mock => {}
        }
        missing
    }

    fn warn_missing(&self) {
        let missing = self.missing_for(self.default_backend);
        if !missing.is_empty() {
            log::warn!(
                "backend '{}' selected as default but missing variables: {}; \
                 requests to it will fail at query time",
                self.default_backend,
                missing.join(", ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_graph_name_uses_topology_suffix() {
        let config = PlatformConfig::default();
        assert_eq!(config.default_graph_name(), "demo-topology");
    }

    #[test]
    fn mock_backend_requires_nothing() {
        let config = PlatformConfig::default();
        assert!(config.missing_for(BackendKind::Mock).is_empty());
    }

    #[test]
    fn gremlin_reports_missing_variables() {
        let config = PlatformConfig::default();
        let missing = config.missing_for(BackendKind::Gremlin);
        assert!(missing.contains(&"GREMLIN_ENDPOINT"));
        assert!(missing.contains(&"GREMLIN_KEY"));
    }
}
