//! Hosted agent-runtime contract.
//!
//! The platform drives an external hosted-agent runtime: agent
//! create-or-update keyed by name, thread create, message post, and run
//! consumption. The runtime's SDK surface is callback-driven and
//! synchronous: [`AgentRuntime::run_thread`] blocks the calling thread and
//! fires [`RunObserver`] callbacks as the run progresses. The orchestration
//! bridge executes it on a dedicated blocking worker and carries the events
//! across a bounded channel.
//!
//! Two implementations:
//! - [`RemoteRuntime`] speaks the hosted runtime's REST surface.
//! - [`StubRuntime`] produces a deterministic four-sub-agent walkthrough for
//!   local development and tests, selected automatically when the runtime
//!   endpoint is not configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::incidentllm::credentials::TokenCredential;
use crate::incidentllm::error::{PlatformError, Result};

/// Terminal and intermediate run states reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Payload of a completed run step. `error` signals a per-step sub-agent
/// failure without terminating the run.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub agent_name: String,
    pub duration_ms: u64,
    pub query: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub tokens: usize,
}

/// Synchronous callback surface consumed by [`AgentRuntime::run_thread`].
pub trait RunObserver: Send {
    fn on_run_update(&mut self, status: RunStatus);
    fn on_step_start(&mut self, agent_name: &str);
    fn on_step_complete(&mut self, outcome: StepOutcome);
    fn on_message(&mut self, text: &str);
}

/// Declarative agent definition the provisioner pushes to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub role: String,
    pub model: String,
    pub instructions: String,
    /// Tool descriptors in the runtime's wire format.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    /// Sub-agent names wired as connected agents (orchestrator only).
    #[serde(default)]
    pub connected_agents: Vec<String>,
    #[serde(default)]
    pub is_orchestrator: bool,
}

/// Contract the hosted runtime must satisfy. Nothing here assumes the
/// runtime can call back into arbitrary user code; all tools it invokes
/// are server-side.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Create-or-update an agent by name; returns the runtime's agent id.
    async fn ensure_agent(&self, definition: &AgentDefinition) -> Result<String>;

    async fn create_thread(&self) -> Result<String>;

    async fn post_message(&self, thread_id: &str, text: &str) -> Result<()>;

    /// Create a run on the thread and consume its events until a terminal
    /// state, firing observer callbacks along the way. Blocking; callers
    /// run this on a dedicated worker.
    fn run_thread(
        &self,
        thread_id: &str,
        agent_id: &str,
        observer: &mut dyn RunObserver,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Stub runtime
// ---------------------------------------------------------------------------

const STUB_AGENTS: [(&str, &str, &str); 4] = [
    (
        "graph-explorer",
        "g.V('LINK-SYD-MEL-FIBRE-01').bothE().otherV().valueMap(true)",
        "LINK-SYD-MEL-FIBRE-01 connects RTR-SYD-01 and RTR-MEL-01; both routers report the interface facing the link as down.",
    ),
    (
        "telemetry-analyst",
        "interface_counters | where device in ('RTR-SYD-01','RTR-MEL-01') | summarize max(errors_out) by device",
        "RTR-SYD-01 et-0/0/1 shows 48k output errors starting 14:29; RTR-MEL-01 mirrors on input. Consistent with a fibre cut, not a config change.",
    ),
    (
        "runbook-knowledge",
        "fibre link down procedure",
        "Runbook NOC-114 applies: confirm optics, dispatch field team, move traffic to the protect path via RTR-BNE-01.",
    ),
    (
        "ticket-historian",
        "LINK-SYD-MEL-FIBRE-01 outage history",
        "Two prior incidents on this span (INC-0819, INC-1042), both fibre cuts near the Albury duct; mean repair 6h.",
    ),
];

/// Deterministic local runtime. Also scriptable: tests can mark agents as
/// failing or make whole run attempts fail to exercise the retry path.
pub struct StubRuntime {
    threads: Mutex<HashMap<String, Vec<String>>>,
    agents: Mutex<HashMap<String, AgentDefinition>>,
    failing_agents: HashSet<String>,
    failed_runs_remaining: AtomicUsize,
    /// Per-step delay, kept at zero in tests.
    step_delay: Duration,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            failing_agents: HashSet::new(),
            failed_runs_remaining: AtomicUsize::new(0),
            step_delay: Duration::from_millis(0),
        }
    }

    /// Make a named sub-agent fail its step on every run.
    pub fn with_failing_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.failing_agents.insert(agent_name.into());
        self
    }

    /// Make the next `count` run attempts end in a failed terminal status.
    pub fn with_failed_runs(self, count: usize) -> Self {
        self.failed_runs_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Ids of every thread created so far.
    pub fn thread_ids(&self) -> Vec<String> {
        self.threads
            .lock()
            .expect("stub threads poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Messages posted to a thread, oldest first.
    pub fn thread_messages(&self, thread_id: &str) -> Vec<String> {
        self.threads
            .lock()
            .expect("stub threads poisoned")
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn known_agents(&self) -> Vec<String> {
        self.agents
            .lock()
            .expect("stub agents poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for StubRuntime {
    async fn ensure_agent(&self, definition: &AgentDefinition) -> Result<String> {
        self.agents
            .lock()
            .expect("stub agents poisoned")
            .insert(definition.name.clone(), definition.clone());
        Ok(format!("stub-{}", definition.name))
    }

    async fn create_thread(&self) -> Result<String> {
        let thread_id = format!("thread-{}", uuid::Uuid::new_v4());
        self.threads
            .lock()
            .expect("stub threads poisoned")
            .insert(thread_id.clone(), Vec::new());
        Ok(thread_id)
    }

    async fn post_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let mut threads = self.threads.lock().expect("stub threads poisoned");
        let messages = threads.get_mut(thread_id).ok_or_else(|| {
            PlatformError::resource_not_found(format!("thread '{}' does not exist", thread_id))
        })?;
        messages.push(text.to_string());
        Ok(())
    }

    fn run_thread(
        &self,
        thread_id: &str,
        _agent_id: &str,
        observer: &mut dyn RunObserver,
    ) -> Result<()> {
        {
            let threads = self.threads.lock().expect("stub threads poisoned");
            if !threads.contains_key(thread_id) {
                return Err(PlatformError::resource_not_found(format!(
                    "thread '{}' does not exist",
                    thread_id
                )));
            }
        }

        observer.on_run_update(RunStatus::InProgress);

        // A scripted whole-run failure surfaces after the first step, the
        // shape observed when the runtime loses a run mid-flight.
        let fail_this_run = self
            .failed_runs_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        for (index, (agent, query, response)) in STUB_AGENTS.iter().enumerate() {
            observer.on_step_start(agent);
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            if self.failing_agents.contains(*agent) {
                observer.on_step_complete(StepOutcome {
                    agent_name: agent.to_string(),
                    duration_ms: 12,
                    query: Some(query.to_string()),
                    response: None,
                    error: Some(format!("{} did not answer: tool call timed out", agent)),
                    tokens: 0,
                });
            } else {
                observer.on_step_complete(StepOutcome {
                    agent_name: agent.to_string(),
                    duration_ms: 240,
                    query: Some(query.to_string()),
                    response: Some(response.to_string()),
                    error: None,
                    tokens: 180,
                });
            }
            if fail_this_run && index == 0 {
                observer.on_run_update(RunStatus::Failed);
                return Ok(());
            }
        }

        let failed_note = if self.failing_agents.is_empty() {
            String::new()
        } else {
            let mut names: Vec<&str> = self.failing_agents.iter().map(String::as_str).collect();
            names.sort();
            format!(
                " Note: {} returned no data; findings are partial.",
                names.join(", ")
            )
        };
        observer.on_message(&format!(
            "Root cause: fibre cut on LINK-SYD-MEL-FIBRE-01. Traffic fails over via \
             RTR-BNE-01 per runbook NOC-114; field dispatch raised. Prior incidents \
             suggest ~6h to repair.{}",
            failed_note
        ));
        observer.on_run_update(RunStatus::Completed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote runtime
// ---------------------------------------------------------------------------

/// REST client for the hosted agent runtime.
///
/// The async methods share the pooled client; `run_thread` keeps the SDK's
/// synchronous polling shape and therefore uses a blocking client. The
/// bridge always calls it from a blocking worker, never from the async
/// scheduler.
pub struct RemoteRuntime {
    endpoint: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

impl RemoteRuntime {
    pub fn new(endpoint: String, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            scope: "https://ai.azure.com/.default".to_string(),
            credential,
            poll_interval: Duration::from_millis(750),
        }
    }

    async fn bearer(&self) -> Result<String> {
        self.credential.token(&self.scope).await
    }

    fn parse_status(raw: &str) -> RunStatus {
        match raw {
            "queued" => RunStatus::Queued,
            "completed" => RunStatus::Completed,
            "failed" | "expired" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::InProgress,
        }
    }
}

#[async_trait]
impl AgentRuntime for RemoteRuntime {
    async fn ensure_agent(&self, definition: &AgentDefinition) -> Result<String> {
        let token = self.bearer().await?;
        let client = crate::incidentllm::backends::common::get_shared_http_client();

        // Idempotent by name: find an existing agent first, then create or
        // update accordingly.
        let listing: serde_json::Value = client
            .get(format!("{}/assistants", self.endpoint))
            .bearer_auth(&token)
            .send()
            .await?
            .json()
            .await
            .map_err(PlatformError::from)?;
        let existing_id = listing
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|agents| {
                agents.iter().find_map(|a| {
                    (a.get("name").and_then(|n| n.as_str()) == Some(definition.name.as_str()))
                        .then(|| a.get("id").and_then(|i| i.as_str()).map(str::to_string))
                        .flatten()
                })
            });

        let body = serde_json::json!({
            "name": definition.name,
            "description": definition.role,
            "model": definition.model,
            "instructions": definition.instructions,
            "tools": definition.tools,
        });
        let url = match &existing_id {
            Some(id) => format!("{}/assistants/{}", self.endpoint, id),
            None => format!("{}/assistants", self.endpoint),
        };
        let response = client
            .post(url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PlatformError::upstream(format!(
                "agent create/update for '{}' failed ({}): {}",
                definition.name, status, text
            )));
        }
        let created: IdResponse = response.json().await.map_err(PlatformError::from)?;
        Ok(created.id)
    }

    async fn create_thread(&self) -> Result<String> {
        let token = self.bearer().await?;
        let response = crate::incidentllm::backends::common::get_shared_http_client()
            .post(format!("{}/threads", self.endpoint))
            .bearer_auth(&token)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PlatformError::upstream(format!(
                "thread create failed ({})",
                response.status()
            )));
        }
        let created: IdResponse = response.json().await.map_err(PlatformError::from)?;
        Ok(created.id)
    }

    async fn post_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let token = self.bearer().await?;
        let response = crate::incidentllm::backends::common::get_shared_http_client()
            .post(format!("{}/threads/{}/messages", self.endpoint, thread_id))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "role": "user", "content": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PlatformError::upstream(format!(
                "message post failed ({})",
                response.status()
            )));
        }
        Ok(())
    }

    fn run_thread(
        &self,
        thread_id: &str,
        agent_id: &str,
        observer: &mut dyn RunObserver,
    ) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PlatformError::internal(e.to_string()))?;
        // Token acquisition is async-only; hop through a small handle.
        let token = tokio::runtime::Handle::try_current()
            .map_err(|_| PlatformError::internal("run_thread needs an ambient tokio runtime"))
            .and_then(|handle| handle.block_on(self.bearer()))?;

        let run: IdResponse = client
            .post(format!("{}/threads/{}/runs", self.endpoint, thread_id))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "assistant_id": agent_id }))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| PlatformError::upstream(format!("run create failed: {}", e)))?;

        let mut reported_steps: HashSet<String> = HashSet::new();
        loop {
            let status_doc: serde_json::Value = client
                .get(format!(
                    "{}/threads/{}/runs/{}",
                    self.endpoint, thread_id, run.id
                ))
                .bearer_auth(&token)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json())
                .map_err(|e| PlatformError::upstream(format!("run poll failed: {}", e)))?;
            let status = Self::parse_status(
                status_doc
                    .get("status")
                    .and_then(|s| s.as_str())
                    .unwrap_or("in_progress"),
            );
            observer.on_run_update(status);

            let steps: serde_json::Value = client
                .get(format!(
                    "{}/threads/{}/runs/{}/steps",
                    self.endpoint, thread_id, run.id
                ))
                .bearer_auth(&token)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.json())
                .map_err(|e| PlatformError::upstream(format!("step poll failed: {}", e)))?;
            if let Some(items) = steps.get("data").and_then(|d| d.as_array()) {
                for item in items {
                    let step_id = item
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let step_status = item.get("status").and_then(|s| s.as_str());
                    if step_status != Some("completed") && step_status != Some("failed") {
                        continue;
                    }
                    if !reported_steps.insert(step_id) {
                        continue;
                    }
                    let agent_name = item
                        .get("agent_name")
                        .and_then(|a| a.as_str())
                        .unwrap_or("agent")
                        .to_string();
                    observer.on_step_start(&agent_name);
                    observer.on_step_complete(StepOutcome {
                        agent_name,
                        duration_ms: item
                            .get("duration_ms")
                            .and_then(|d| d.as_u64())
                            .unwrap_or(0),
                        query: item
                            .get("query")
                            .and_then(|q| q.as_str())
                            .map(str::to_string),
                        response: item
                            .get("output")
                            .and_then(|o| o.as_str())
                            .map(str::to_string),
                        error: (step_status == Some("failed"))
                            .then(|| "sub-agent step failed".to_string()),
                        tokens: item
                            .get("usage")
                            .and_then(|u| u.get("total_tokens"))
                            .and_then(|t| t.as_u64())
                            .unwrap_or(0) as usize,
                    });
                }
            }

            if status.is_terminal() {
                if status == RunStatus::Completed {
                    // Fetch the final synthesised message.
                    let messages: serde_json::Value = client
                        .get(format!("{}/threads/{}/messages", self.endpoint, thread_id))
                        .bearer_auth(&token)
                        .send()
                        .and_then(|r| r.error_for_status())
                        .and_then(|r| r.json())
                        .map_err(|e| {
                            PlatformError::upstream(format!("message fetch failed: {}", e))
                        })?;
                    if let Some(text) = messages
                        .get("data")
                        .and_then(|d| d.as_array())
                        .and_then(|list| list.first())
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_str())
                    {
                        observer.on_message(text);
                    }
                }
                return Ok(());
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        statuses: Vec<RunStatus>,
        steps: Vec<StepOutcome>,
        messages: Vec<String>,
    }

    impl RunObserver for RecordingObserver {
        fn on_run_update(&mut self, status: RunStatus) {
            self.statuses.push(status);
        }
        fn on_step_start(&mut self, _agent_name: &str) {}
        fn on_step_complete(&mut self, outcome: StepOutcome) {
            self.steps.push(outcome);
        }
        fn on_message(&mut self, text: &str) {
            self.messages.push(text.to_string());
        }
    }

    #[tokio::test]
    async fn stub_walkthrough_covers_four_agents() {
        let runtime = StubRuntime::new();
        let thread = runtime.create_thread().await.unwrap();
        runtime.post_message(&thread, "alert").await.unwrap();

        let mut observer = RecordingObserver::default();
        runtime
            .run_thread(&thread, "stub-orchestrator", &mut observer)
            .unwrap();

        assert_eq!(observer.steps.len(), 4);
        assert!(observer.steps.iter().all(|s| s.error.is_none()));
        assert_eq!(observer.messages.len(), 1);
        assert_eq!(*observer.statuses.last().unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn stub_failing_agent_degrades_gracefully() {
        let runtime = StubRuntime::new().with_failing_agent("telemetry-analyst");
        let thread = runtime.create_thread().await.unwrap();

        let mut observer = RecordingObserver::default();
        runtime.run_thread(&thread, "x", &mut observer).unwrap();

        let failed: Vec<_> = observer
            .steps
            .iter()
            .filter(|s| s.error.is_some())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].agent_name, "telemetry-analyst");
        // The run still completes with a partial report.
        assert_eq!(*observer.statuses.last().unwrap(), RunStatus::Completed);
        assert!(observer.messages[0].contains("partial"));
    }

    #[tokio::test]
    async fn stub_scripted_run_failures_are_consumed() {
        let runtime = StubRuntime::new().with_failed_runs(1);
        let thread = runtime.create_thread().await.unwrap();

        let mut first = RecordingObserver::default();
        runtime.run_thread(&thread, "x", &mut first).unwrap();
        assert_eq!(*first.statuses.last().unwrap(), RunStatus::Failed);
        assert!(first.messages.is_empty());

        let mut second = RecordingObserver::default();
        runtime.run_thread(&thread, "x", &mut second).unwrap();
        assert_eq!(*second.statuses.last().unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn stub_threads_accumulate_messages() {
        let runtime = StubRuntime::new();
        let thread = runtime.create_thread().await.unwrap();
        runtime.post_message(&thread, "first").await.unwrap();
        runtime.post_message(&thread, "second").await.unwrap();
        assert_eq!(runtime.thread_messages(&thread), vec!["first", "second"]);

        let err = runtime.post_message("missing", "x").await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");
    }
}
