//! Agent provisioner.
//!
//! Activating a scenario rebuilds the agent fleet on the hosted runtime:
//! every declared agent gets its system prompt composed from fragments, its
//! tools generated from templates, and a create-or-update push keyed by
//! name. The orchestrator is created LAST because its connected-agent tool
//! list references the sub-agents' runtime ids.
//!
//! # The enum-vs-default rule
//!
//! Routing-identity parameters in generated openapi specs MUST be
//! single-value `enum` constraints, never `default`. An LLM treats a
//! `default` as a hint and will happily invent a plausible header value,
//! which routes the tool call to the wrong scenario and returns empty
//! results. [`verify_routing_enum`] enforces the rule on every spec the
//! provisioner emits.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::incidentllm::backend::BackendKind;
use crate::incidentllm::config::PlatformConfig;
use crate::incidentllm::error::{PlatformError, Result};
use crate::incidentllm::runtime::{AgentDefinition, AgentRuntime};
use crate::incidentllm::scenario::validate_scenario_name;
use crate::incidentllm::sse::{EventBus, EventRecord};
use crate::incidentllm::store::{DocumentStore, PROMPTS_CONTAINER, SCENARIO_CONFIGS_CONTAINER};

const GRAPH_QUERY_TEMPLATE: &str = include_str!("../../templates/graph_query_tool.json");
const TELEMETRY_QUERY_TEMPLATE: &str = include_str!("../../templates/telemetry_query_tool.json");

const CORE_INSTRUCTIONS: &str = "You are part of an incident-investigation team. Work only \
from data returned by your tools; cite device and resource identifiers exactly as the tools \
return them. If a tool reports an error, read the message, correct your query, and retry.";

const ORCHESTRATOR_INSTRUCTIONS: &str = "You coordinate the specialist agents. Send each one \
the alert context, collect their findings, and synthesise a single incident report with a \
root cause, impact, and recommended actions. If a specialist fails or returns nothing, note \
the gap and continue with the remaining specialists; a partial report is better than none.";

fn language_fragment(key: &str) -> &'static str {
    match key {
        "gremlin" => {
            "Write graph queries in the Gremlin traversal language, e.g. \
             g.V().hasLabel('Router').valueMap(true). Anchor traversals on specific vertex \
             ids where possible."
        }
        "gql" => {
            "Write graph queries in ISO GQL, e.g. MATCH (n:Router)-[r]->(m) RETURN n, r, m. \
             Keep result sets bounded with LIMIT."
        }
        "kql" => {
            "Write telemetry queries in KQL, e.g. \
             interface_counters | where device == 'RTR-SYD-01' | summarize max(errors_out)."
        }
        "sql" => {
            "Write telemetry queries as document SQL, e.g. \
             SELECT * FROM c WHERE c.device = 'RTR-SYD-01'."
        }
        _ => {
            "Describe what you want to know in plain language; the demo backend matches \
             phrases like 'which links are down' or 'what is connected to <id>'."
        }
    }
}

/// One data-source declaration in a scenario config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceDecl {
    pub connector: String,
    #[serde(default)]
    pub config: Value,
}

/// One tool declaration on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    #[serde(rename = "type")]
    pub tool_type: String,
    /// openapi: template name under the templates directory.
    #[serde(default)]
    pub template: Option<String>,
    /// azure_ai_search: which declared index key to bind.
    #[serde(default)]
    pub index_key: Option<String>,
}

/// One agent declaration in a scenario config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Data-source role this agent queries; resolves the connector.
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDecl>,
    #[serde(default)]
    pub orchestrator: bool,
    #[serde(default)]
    pub connected_agents: Vec<String>,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

/// Parsed scenario manifest, source of truth for provisioning decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub scenario_name: String,
    #[serde(default)]
    pub data_sources: HashMap<String, DataSourceDecl>,
    pub agents: Vec<AgentConfig>,
    /// Graph schema hints used to auto-generate the schema prompt fragment.
    #[serde(default)]
    pub graph_schema: Option<GraphSchemaDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphSchemaDecl {
    #[serde(default)]
    pub vertex_labels: Vec<String>,
    #[serde(default)]
    pub edge_labels: Vec<String>,
}

impl ScenarioConfig {
    /// The standard five-agent fleet, used when a scenario never uploaded a
    /// config of its own.
    pub fn default_for(scenario_name: &str) -> Self {
        let specialist = |name: &str, role: &str, tools: Vec<ToolDecl>, data_source: Option<&str>| {
            AgentConfig {
                name: name.to_string(),
                role: role.to_string(),
                model: default_model(),
                data_source: data_source.map(str::to_string),
                tools,
                orchestrator: false,
                connected_agents: Vec::new(),
            }
        };
        Self {
            scenario_name: scenario_name.to_string(),
            data_sources: HashMap::from([
                (
                    "graph".to_string(),
                    DataSourceDecl {
                        connector: "mock".to_string(),
                        config: Value::Null,
                    },
                ),
                (
                    "telemetry".to_string(),
                    DataSourceDecl {
                        connector: "mock".to_string(),
                        config: Value::Null,
                    },
                ),
            ]),
            agents: vec![
                specialist(
                    "graph-explorer",
                    "Explores the service topology graph",
                    vec![ToolDecl {
                        tool_type: "openapi".to_string(),
                        template: Some("graph_query_tool".to_string()),
                        index_key: None,
                    }],
                    Some("graph"),
                ),
                specialist(
                    "telemetry-analyst",
                    "Analyses device telemetry and counters",
                    vec![ToolDecl {
                        tool_type: "openapi".to_string(),
                        template: Some("telemetry_query_tool".to_string()),
                        index_key: None,
                    }],
                    Some("telemetry"),
                ),
                specialist(
                    "runbook-knowledge",
                    "Finds applicable operational runbooks",
                    vec![ToolDecl {
                        tool_type: "azure_ai_search".to_string(),
                        template: None,
                        index_key: Some("runbooks".to_string()),
                    }],
                    None,
                ),
                specialist(
                    "ticket-historian",
                    "Recalls similar historical incidents",
                    vec![ToolDecl {
                        tool_type: "azure_ai_search".to_string(),
                        template: None,
                        index_key: Some("tickets".to_string()),
                    }],
                    None,
                ),
                AgentConfig {
                    name: "orchestrator".to_string(),
                    role: "Coordinates the investigation".to_string(),
                    model: default_model(),
                    data_source: None,
                    tools: vec![ToolDecl {
                        tool_type: "connected_agent".to_string(),
                        template: None,
                        index_key: None,
                    }],
                    orchestrator: true,
                    connected_agents: vec![
                        "graph-explorer".to_string(),
                        "telemetry-analyst".to_string(),
                        "runbook-knowledge".to_string(),
                        "ticket-historian".to_string(),
                    ],
                },
            ],
            graph_schema: None,
        }
    }

    fn connector_for(&self, agent: &AgentConfig) -> BackendKind {
        agent
            .data_source
            .as_deref()
            .and_then(|role| self.data_sources.get(role))
            .and_then(|decl| decl.connector.parse::<BackendKind>().ok())
            .unwrap_or(BackendKind::Mock)
    }
}

/// Assert that every routing-identity header in an openapi spec is a
/// single-value enum. Returns `validation` when a `default:` sneaks in.
pub fn verify_routing_enum(spec: &Value) -> Result<()> {
    fn walk(value: &Value, errors: &mut Vec<String>) {
        if let Some(object) = value.as_object() {
            let is_header_param = object.get("in").and_then(Value::as_str) == Some("header");
            if is_header_param {
                let name = object.get("name").and_then(Value::as_str).unwrap_or("");
                if let Some(schema) = object.get("schema") {
                    if schema.get("default").is_some() {
                        errors.push(format!("header parameter '{}' uses default:", name));
                    }
                    let single_enum = schema
                        .get("enum")
                        .and_then(Value::as_array)
                        .map(|items| items.len() == 1)
                        .unwrap_or(false);
                    if !single_enum {
                        errors.push(format!(
                            "header parameter '{}' is not a single-value enum",
                            name
                        ));
                    }
                }
            }
            for nested in object.values() {
                walk(nested, errors);
            }
        } else if let Some(items) = value.as_array() {
            for nested in items {
                walk(nested, errors);
            }
        }
    }

    let mut errors = Vec::new();
    walk(spec, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(PlatformError::validation(errors.join("; ")))
    }
}

/// Provisions the agent fleet for a scenario on the hosted runtime.
pub struct AgentProvisioner {
    store: Arc<dyn DocumentStore>,
    runtime: Arc<dyn AgentRuntime>,
    bus: Arc<EventBus>,
    config: PlatformConfig,
    /// Process-wide activation lock: concurrent provisioner runs would
    /// interleave agent writes. Held for the whole activation.
    activation: Mutex<()>,
}

impl AgentProvisioner {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        runtime: Arc<dyn AgentRuntime>,
        bus: Arc<EventBus>,
        config: PlatformConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            bus,
            config,
            activation: Mutex::new(()),
        }
    }

    fn progress(&self, source: &str, step: &str, detail: String, pct: u8) {
        self.bus.publish(
            source,
            EventRecord::progress(serde_json::json!({
                "step": step,
                "detail": detail,
                "pct": pct,
            })),
        );
    }

    /// Activate a scenario: compose prompts, build tools, push agents, and
    /// write the agent-id map. Emits progress on `source` and `complete`
    /// with the map on success. A concurrent activation gets `conflict`.
    pub async fn activate(&self, scenario_name: &str, source: &str) -> Result<HashMap<String, String>> {
        validate_scenario_name(scenario_name)?;
        let _lock = self.activation.try_lock().map_err(|_| {
            PlatformError::conflict("another scenario activation is in progress; retry shortly")
        })?;

        self.progress(source, "loading_config", scenario_name.to_string(), 5);
        let scenario_config = self.load_config(scenario_name).await?;

        // Sub-agents first; the orchestrator needs their ids.
        let mut ordered: Vec<&AgentConfig> = scenario_config
            .agents
            .iter()
            .filter(|a| !a.orchestrator)
            .collect();
        let orchestrators: Vec<&AgentConfig> = scenario_config
            .agents
            .iter()
            .filter(|a| a.orchestrator)
            .collect();
        ordered.extend(orchestrators);

        let total = ordered.len().max(1);
        let mut agent_ids: HashMap<String, String> = HashMap::new();
        for (index, agent) in ordered.into_iter().enumerate() {
            let connector = scenario_config.connector_for(agent);
            self.progress(
                source,
                "provisioning_agent",
                agent.name.clone(),
                (10 + index * 80 / total) as u8,
            );

            let instructions = self
                .compose_prompt(&scenario_config, agent, connector)
                .await?;
            let tools = self.build_tools(scenario_name, agent, connector, &agent_ids)?;

            let definition = AgentDefinition {
                name: agent.name.clone(),
                role: agent.role.clone(),
                model: agent.model.clone(),
                instructions,
                tools,
                connected_agents: agent.connected_agents.clone(),
                is_orchestrator: agent.orchestrator,
            };
            let id = self.runtime.ensure_agent(&definition).await?;
            log::info!("provisioned agent '{}' as {}", agent.name, id);
            agent_ids.insert(agent.name.clone(), id);
        }

        self.progress(source, "writing_agent_map", scenario_name.to_string(), 95);
        self.store
            .ensure_container(SCENARIO_CONFIGS_CONTAINER)
            .await?;
        self.store
            .upsert(
                SCENARIO_CONFIGS_CONTAINER,
                serde_json::json!({
                    "id": self.config.runtime.agent_map_id,
                    "scenario_name": scenario_name,
                    "agents": agent_ids,
                    "updated_at": chrono::Utc::now(),
                }),
            )
            .await?;

        Ok(agent_ids)
    }

    async fn load_config(&self, scenario_name: &str) -> Result<ScenarioConfig> {
        match self
            .store
            .get(SCENARIO_CONFIGS_CONTAINER, scenario_name)
            .await
        {
            Ok(Some(doc)) => serde_json::from_value(doc).map_err(|e| {
                PlatformError::validation(format!(
                    "scenario config for '{}' is malformed: {}",
                    scenario_name, e
                ))
            }),
            Ok(None) | Err(PlatformError::ResourceNotFound(_)) => {
                Ok(ScenarioConfig::default_for(scenario_name))
            }
            Err(e) => Err(e),
        }
    }

    /// System prompt = core instructions, then the schema fragment, then the
    /// connector's query-language fragment, in that fixed order. A prompt
    /// document uploaded for the agent replaces the core fragment only.
    async fn compose_prompt(
        &self,
        scenario_config: &ScenarioConfig,
        agent: &AgentConfig,
        connector: BackendKind,
    ) -> Result<String> {
        let scenario = &scenario_config.scenario_name;
        let stored = match self
            .store
            .get(
                PROMPTS_CONTAINER,
                &format!("{}__{}__v1", scenario, agent.name),
            )
            .await
        {
            Ok(Some(doc)) => doc
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };

        let core = stored.unwrap_or_else(|| {
            if agent.orchestrator {
                ORCHESTRATOR_INSTRUCTIONS.to_string()
            } else {
                format!("{}\n\nYour specialty: {}.", CORE_INSTRUCTIONS, agent.role)
            }
        });

        let mut parts = vec![core];
        if let Some(schema) = &scenario_config.graph_schema {
            parts.push(schema_fragment(schema));
        }
        if agent.data_source.is_some() {
            parts.push(language_fragment(connector.language_key()).to_string());
        }
        Ok(parts.join("\n\n"))
    }

    fn build_tools(
        &self,
        scenario_name: &str,
        agent: &AgentConfig,
        connector: BackendKind,
        agent_ids: &HashMap<String, String>,
    ) -> Result<Vec<Value>> {
        let mut tools = Vec::new();
        for decl in &agent.tools {
            match decl.tool_type.as_str() {
                "openapi" => {
                    let template = decl.template.as_deref().unwrap_or("graph_query_tool");
                    let spec = self.fill_openapi_template(template, scenario_name, connector)?;
                    verify_routing_enum(&spec)?;
                    tools.push(serde_json::json!({
                        "type": "openapi",
                        "openapi": spec,
                    }));
                }
                "azure_ai_search" => {
                    let key = decl.index_key.as_deref().ok_or_else(|| {
                        PlatformError::validation(format!(
                            "agent '{}' declares a search tool without index_key",
                            agent.name
                        ))
                    })?;
                    tools.push(serde_json::json!({
                        "type": "azure_ai_search",
                        "index_name": format!("{}-{}-index", scenario_name, key),
                    }));
                }
                "connected_agent" => {
                    if !agent.orchestrator {
                        return Err(PlatformError::validation(format!(
                            "agent '{}' declares connected_agent but is not the orchestrator",
                            agent.name
                        )));
                    }
                    for connected in &agent.connected_agents {
                        let id = agent_ids.get(connected).ok_or_else(|| {
                            PlatformError::internal(format!(
                                "connected agent '{}' was not provisioned before the orchestrator",
                                connected
                            ))
                        })?;
                        tools.push(serde_json::json!({
                            "type": "connected_agent",
                            "name": connected,
                            "agent_id": id,
                        }));
                    }
                }
                other => {
                    return Err(PlatformError::validation(format!(
                        "agent '{}' declares unknown tool type '{}'",
                        agent.name, other
                    )));
                }
            }
        }
        Ok(tools)
    }

    fn template_source(&self, template: &str) -> Result<String> {
        if let Some(dir) = &self.config.templates_dir {
            let path = std::path::Path::new(dir).join(format!("{}.json", template));
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(PlatformError::from);
            }
        }
        match template {
            "graph_query_tool" => Ok(GRAPH_QUERY_TEMPLATE.to_string()),
            "telemetry_query_tool" => Ok(TELEMETRY_QUERY_TEMPLATE.to_string()),
            other => Err(PlatformError::validation(format!(
                "unknown openapi template '{}'",
                other
            ))),
        }
    }

    fn fill_openapi_template(
        &self,
        template: &str,
        scenario_name: &str,
        connector: BackendKind,
    ) -> Result<Value> {
        let raw = self.template_source(template)?;
        let graph_name = format!("{}-topology", scenario_name);
        let filled = raw
            .replace("{base_url}", &self.config.public_base_url)
            .replace("{graph_name}", &graph_name)
            .replace(
                "{query_language_description}",
                connector.query_language_description(),
            );
        serde_json::from_str(&filled).map_err(|e| {
            PlatformError::validation(format!(
                "openapi template '{}' does not parse after substitution: {}",
                template, e
            ))
        })
    }
}

fn schema_fragment(schema: &GraphSchemaDecl) -> String {
    format!(
        "Graph schema: vertex labels [{}]; edge labels [{}].",
        schema.vertex_labels.join(", "),
        schema.edge_labels.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidentllm::runtime::StubRuntime;
    use crate::incidentllm::store::MemoryStore;

    fn provisioner() -> (AgentProvisioner, Arc<StubRuntime>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(StubRuntime::new());
        let bus = Arc::new(EventBus::new(100, 256));
        let provisioner = AgentProvisioner::new(
            store.clone(),
            runtime.clone(),
            bus,
            PlatformConfig::default(),
        );
        (provisioner, runtime, store)
    }

    #[tokio::test]
    async fn activation_provisions_all_five_agents() {
        let (provisioner, runtime, _) = provisioner();
        let ids = provisioner.activate("telco-noc", "activation").await.unwrap();
        assert_eq!(ids.len(), 5);
        assert!(ids.contains_key("orchestrator"));
        assert_eq!(runtime.known_agents().len(), 5);
    }

    #[tokio::test]
    async fn generated_specs_use_single_value_enum_never_default() {
        let (provisioner, _, _) = provisioner();
        for template in ["graph_query_tool", "telemetry_query_tool"] {
            let spec = provisioner
                .fill_openapi_template(template, "telco-noc", BackendKind::Gremlin)
                .unwrap();
            verify_routing_enum(&spec).unwrap();

            let param = spec
                .pointer(match template {
                    "graph_query_tool" => "/paths/~1query~1graph/post/parameters/0",
                    _ => "/paths/~1query~1telemetry/post/parameters/0",
                })
                .unwrap();
            assert_eq!(param["name"], "X-Graph");
            assert_eq!(
                param["schema"]["enum"],
                serde_json::json!(["telco-noc-topology"])
            );
            assert!(param["schema"].get("default").is_none());
        }
    }

    #[test]
    fn verify_routing_enum_rejects_default() {
        let spec = serde_json::json!({
            "paths": {"/q": {"post": {"parameters": [{
                "name": "X-Graph", "in": "header",
                "schema": {"type": "string", "default": "demo-topology"}
            }]}}}
        });
        let err = verify_routing_enum(&spec).unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[tokio::test]
    async fn uploaded_prompt_replaces_core_fragment_only() {
        let (provisioner, runtime, store) = provisioner();
        store.ensure_container(PROMPTS_CONTAINER).await.unwrap();
        store
            .upsert(
                PROMPTS_CONTAINER,
                serde_json::json!({
                    "id": "telco-noc__graph-explorer__v1",
                    "agent": "graph-explorer",
                    "scenario": "telco-noc",
                    "version": 1,
                    "content": "CUSTOM GRAPH EXPLORER PROMPT",
                }),
            )
            .await
            .unwrap();

        provisioner.activate("telco-noc", "activation").await.unwrap();
        drop(runtime);

        // The composed prompt kept the custom core and appended the
        // language fragment for the connector.
        let config = ScenarioConfig::default_for("telco-noc");
        let agent = config
            .agents
            .iter()
            .find(|a| a.name == "graph-explorer")
            .unwrap();
        let composed = provisioner
            .compose_prompt(&config, agent, BackendKind::Mock)
            .await
            .unwrap();
        assert!(composed.starts_with("CUSTOM GRAPH EXPLORER PROMPT"));
        assert!(composed.contains("plain language"));
    }

    #[tokio::test]
    async fn concurrent_activation_gets_conflict() {
        let (provisioner, _, _) = provisioner();
        let guard = provisioner.activation.lock().await;
        let err = provisioner.activate("telco-noc", "s").await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
        drop(guard);
    }

    #[tokio::test]
    async fn templates_dir_overrides_builtin_template() {
        let dir = tempfile::tempdir().unwrap();
        let custom = serde_json::json!({
            "openapi": "3.0.1",
            "info": {"title": "custom", "version": "1"},
            "servers": [{"url": "{base_url}"}],
            "paths": {"/query/graph": {"post": {"parameters": [{
                "name": "X-Graph", "in": "header", "required": true,
                "schema": {"type": "string", "enum": ["{graph_name}"]}
            }]}}}
        });
        std::fs::write(
            dir.path().join("graph_query_tool.json"),
            custom.to_string(),
        )
        .unwrap();

        let mut config = PlatformConfig::default();
        config.templates_dir = Some(dir.path().to_string_lossy().into_owned());
        let provisioner = AgentProvisioner::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StubRuntime::new()),
            Arc::new(EventBus::new(100, 256)),
            config,
        );

        let spec = provisioner
            .fill_openapi_template("graph_query_tool", "telco-noc", BackendKind::Mock)
            .unwrap();
        assert_eq!(spec["info"]["title"], "custom");
        verify_routing_enum(&spec).unwrap();
    }

    #[tokio::test]
    async fn language_fragment_follows_connector() {
        let (provisioner, _, _) = provisioner();
        let mut config = ScenarioConfig::default_for("telco-noc");
        config
            .data_sources
            .get_mut("graph")
            .unwrap()
            .connector = "cosmosdb-gremlin".to_string();
        let agent = config
            .agents
            .iter()
            .find(|a| a.name == "graph-explorer")
            .unwrap();
        let connector = config.connector_for(agent);
        assert_eq!(connector, BackendKind::Gremlin);
        let composed = provisioner
            .compose_prompt(&config, agent, connector)
            .await
            .unwrap();
        assert!(composed.contains("Gremlin traversal language"));
    }

    #[tokio::test]
    async fn schema_fragment_sits_between_core_and_language() {
        let (provisioner, _, _) = provisioner();
        let mut config = ScenarioConfig::default_for("telco-noc");
        config.graph_schema = Some(GraphSchemaDecl {
            vertex_labels: vec!["Router".to_string(), "Link".to_string()],
            edge_labels: vec!["connects".to_string()],
        });
        let agent = config
            .agents
            .iter()
            .find(|a| a.name == "graph-explorer")
            .unwrap();
        let composed = provisioner
            .compose_prompt(&config, agent, BackendKind::Mock)
            .await
            .unwrap();

        let schema_at = composed.find("Graph schema:").unwrap();
        let language_at = composed.find("plain language").unwrap();
        assert!(schema_at < language_at);
    }
}
