//! Orchestration bridge: alert in, ordered SSE events out.
//!
//! The external agent runtime exposes a synchronous, callback-driven
//! consumer ([`AgentRuntime::run_thread`]). The bridge runs that consumer on
//! a dedicated blocking worker, carries its callbacks across a bounded
//! channel, and publishes structured events through the SSE substrate with
//! dense, monotonically increasing step indices.
//!
//! # Retry on a preserved thread
//!
//! A failed run is retried at most once (MAX_RUN_ATTEMPTS = 2), and the
//! retry reuses the SAME conversation thread: a human-readable recovery
//! message is posted into it and a new run is created against the
//! orchestrator, so the second attempt keeps everything the agents already
//! learned. Collapsing this to a fresh-thread loop discards that context.
//!
//! # Event kinds
//!
//! `run_start`, `step_thinking`, `step_start`, `step_complete` (optionally
//! carrying `error: true` for a failed sub-agent), `message`, `error`,
//! `run_complete`.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;

use crate::incidentllm::error::Result;
use crate::incidentllm::runtime::{
    AgentRuntime, RunObserver, RunStatus, StepOutcome,
};
use crate::incidentllm::sse::{EventBus, EventRecord};
use crate::incidentllm::store::{DocumentStore, HISTORY_CONTAINER, SCENARIO_CONFIGS_CONTAINER};

/// Maximum run attempts per alert, counting the first.
pub const MAX_RUN_ATTEMPTS: u32 = 2;

/// Orchestrator id used until the provisioner writes an agent-id map.
const DEFAULT_ORCHESTRATOR_ID: &str = "stub-orchestrator";

/// Capacity of the worker-to-async event channel. The blocking worker
/// parks when the drain side falls behind, which is fine on a
/// dedicated thread.
const WORKER_CHANNEL_CAPACITY: usize = 64;

enum WorkerEvent {
    RunUpdate(RunStatus),
    StepStart(String),
    StepComplete(StepOutcome),
    Message(String),
}

struct ChannelObserver {
    tx: mpsc::Sender<WorkerEvent>,
}

impl ChannelObserver {
    fn send(&self, event: WorkerEvent) {
        // The drain task only stops at process teardown; a send error means
        // nobody is listening anymore and the event can be dropped.
        let _ = self.tx.blocking_send(event);
    }
}

impl RunObserver for ChannelObserver {
    fn on_run_update(&mut self, status: RunStatus) {
        self.send(WorkerEvent::RunUpdate(status));
    }

    fn on_step_start(&mut self, agent_name: &str) {
        self.send(WorkerEvent::StepStart(agent_name.to_string()));
    }

    fn on_step_complete(&mut self, outcome: StepOutcome) {
        self.send(WorkerEvent::StepComplete(outcome));
    }

    fn on_message(&mut self, text: &str) {
        self.send(WorkerEvent::Message(text.to_string()));
    }
}

/// Result of draining one run attempt.
struct AttemptOutcome {
    failed: bool,
    failure_detail: String,
}

/// Converts alert submissions into orchestrated runs with SSE progress.
pub struct OrchestrationBridge {
    runtime: Arc<dyn AgentRuntime>,
    bus: Arc<EventBus>,
    store: Arc<dyn DocumentStore>,
    /// Document id of the agent-id map the provisioner maintains.
    agent_map_id: String,
    run_counter: AtomicU64,
    history_ready: OnceCell<()>,
}

impl OrchestrationBridge {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        bus: Arc<EventBus>,
        store: Arc<dyn DocumentStore>,
        agent_map_id: String,
    ) -> Self {
        Self {
            runtime,
            bus,
            store,
            agent_map_id,
            run_counter: AtomicU64::new(1),
            history_ready: OnceCell::new(),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Orchestrator agent id from the provisioner's agent-id map, falling
    /// back to the stub id when no activation has run yet.
    async fn lookup_orchestrator(&self) -> String {
        match self
            .store
            .get(SCENARIO_CONFIGS_CONTAINER, &self.agent_map_id)
            .await
        {
            Ok(Some(doc)) => doc
                .pointer("/agents/orchestrator")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_ORCHESTRATOR_ID)
                .to_string(),
            _ => DEFAULT_ORCHESTRATOR_ID.to_string(),
        }
    }

    /// Start an investigation. Emits `run_start` synchronously, then drives
    /// the run on a background task. Returns the SSE source tag the caller
    /// subscribes to.
    pub fn submit_alert(self: Arc<Self>, alert: String, scenario: String) -> String {
        let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst);
        let source = format!("run:{}", run_id);

        self.bus.publish(
            &source,
            EventRecord::of(
                "run_start",
                serde_json::json!({
                    "run_id": run_id,
                    "alert": alert,
                    "timestamp": Utc::now(),
                }),
            ),
        );

        let task_source = source.clone();
        tokio::spawn(async move {
            self.drive_run(run_id, alert, scenario, task_source).await;
        });
        source
    }

    async fn drive_run(&self, run_id: u64, alert: String, scenario: String, source: String) {
        let started = Instant::now();
        let mut step_index: u64 = 0;
        let mut total_tokens: usize = 0;
        let mut attempts: u32 = 0;
        let mut outcome = "complete";

        let thread_id = match self.runtime.create_thread().await {
            Ok(id) => id,
            Err(e) => {
                self.bus
                    .publish(&source, EventRecord::error(format!("thread create failed: {}", e)));
                return;
            }
        };
        if let Err(e) = self.runtime.post_message(&thread_id, &alert).await {
            self.bus
                .publish(&source, EventRecord::error(format!("message post failed: {}", e)));
            return;
        }
        let orchestrator_id = self.lookup_orchestrator().await;

        loop {
            attempts += 1;
            let attempt_result = self
                .drive_attempt(
                    &thread_id,
                    &orchestrator_id,
                    &source,
                    &mut step_index,
                    &mut total_tokens,
                )
                .await;

            match attempt_result {
                Ok(attempt) if !attempt.failed => {
                    self.bus.publish(
                        &source,
                        EventRecord::of(
                            "run_complete",
                            serde_json::json!({
                                "run_id": run_id,
                                "steps": step_index,
                                "tokens": total_tokens,
                                "time_ms": started.elapsed().as_millis() as u64,
                                "attempts": attempts,
                            }),
                        ),
                    );
                    break;
                }
                Ok(attempt) => {
                    if attempts >= MAX_RUN_ATTEMPTS {
                        outcome = "failed";
                        self.bus.publish(
                            &source,
                            EventRecord::error(format!(
                                "run failed after {} attempts: {}",
                                attempts, attempt.failure_detail
                            )),
                        );
                        break;
                    }
                    // No error event yet: post the recovery message into
                    // the SAME thread and create a fresh run on it.
                    log::warn!(
                        "run {} attempt {} failed ({}); retrying on the same thread",
                        run_id,
                        attempts,
                        attempt.failure_detail
                    );
                    let recovery = format!(
                        "The previous investigation run ended early: {}. The findings \
                         gathered so far are in this conversation. Resume the \
                         investigation, re-run any sub-agent whose step failed, and \
                         produce the final report.",
                        attempt.failure_detail
                    );
                    if let Err(e) = self.runtime.post_message(&thread_id, &recovery).await {
                        outcome = "failed";
                        self.bus.publish(
                            &source,
                            EventRecord::error(format!("recovery message post failed: {}", e)),
                        );
                        break;
                    }
                }
                Err(e) => {
                    outcome = "failed";
                    self.bus.publish(
                        &source,
                        EventRecord::error(format!("transport failure during run: {}", e)),
                    );
                    break;
                }
            }
        }

        if let Err(e) = self
            .record_history(run_id, &alert, &scenario, attempts, step_index, outcome)
            .await
        {
            log::warn!("run {} history write failed: {}", run_id, e);
        }
    }

    /// Run one attempt on its blocking worker and drain events into the
    /// bus. Returns whether the runtime reported the run as failed.
    async fn drive_attempt(
        &self,
        thread_id: &str,
        orchestrator_id: &str,
        source: &str,
        step_index: &mut u64,
        total_tokens: &mut usize,
    ) -> Result<AttemptOutcome> {
        let (tx, mut rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let runtime = self.runtime.clone();
        let worker_thread = thread_id.to_string();
        let agent_id = orchestrator_id.to_string();

        let worker = tokio::task::spawn_blocking(move || {
            let mut observer = ChannelObserver { tx };
            runtime.run_thread(&worker_thread, &agent_id, &mut observer)
        });

        let mut failed = false;
        let mut failure_detail = String::from("runtime reported a failed terminal status");
        let mut last_status: Option<RunStatus> = None;
        let mut current_step: Option<u64> = None;

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::RunUpdate(status) => {
                    if status == RunStatus::Failed || status == RunStatus::Cancelled {
                        failed = true;
                    }
                    if !status.is_terminal() && last_status != Some(status) {
                        self.bus.publish(
                            source,
                            EventRecord::of(
                                "step_thinking",
                                serde_json::json!({ "status": "orchestrator working" }),
                            ),
                        );
                    }
                    last_status = Some(status);
                }
                WorkerEvent::StepStart(agent_name) => {
                    let index = *step_index;
                    current_step = Some(index);
                    self.bus.publish(
                        source,
                        EventRecord::of(
                            "step_start",
                            serde_json::json!({
                                "step_index": index,
                                "agent_name": agent_name,
                            }),
                        ),
                    );
                }
                WorkerEvent::StepComplete(outcome) => {
                    let index = current_step.take().unwrap_or(*step_index);
                    *step_index = index + 1;
                    *total_tokens += outcome.tokens;
                    if let Some(error) = &outcome.error {
                        failure_detail = format!(
                            "sub-agent {} failed: {}",
                            outcome.agent_name, error
                        );
                    }
                    let mut payload = serde_json::json!({
                        "step_index": index,
                        "agent_name": outcome.agent_name,
                        "duration_ms": outcome.duration_ms,
                    });
                    if let Some(query) = outcome.query {
                        payload["query"] = serde_json::Value::String(query);
                    }
                    if let Some(response) = outcome.response {
                        payload["response"] = serde_json::Value::String(response);
                    }
                    if let Some(error) = outcome.error {
                        payload["error"] = serde_json::Value::Bool(true);
                        payload["error_detail"] = serde_json::Value::String(error);
                    }
                    self.bus
                        .publish(source, EventRecord::of("step_complete", payload));
                }
                WorkerEvent::Message(text) => {
                    self.bus.publish(
                        source,
                        EventRecord::of("message", serde_json::json!({ "text": text })),
                    );
                }
            }
        }

        // Channel closed: the worker is done. Join it to surface transport
        // errors from the runtime itself.
        worker
            .await
            .map_err(|e| crate::incidentllm::error::PlatformError::internal(format!(
                "runtime worker panicked: {}",
                e
            )))??;

        Ok(AttemptOutcome {
            failed,
            failure_detail,
        })
    }

    async fn record_history(
        &self,
        run_id: u64,
        alert: &str,
        scenario: &str,
        attempts: u32,
        steps: u64,
        outcome: &str,
    ) -> Result<()> {
        self.history_ready
            .get_or_try_init(|| async { self.store.ensure_container(HISTORY_CONTAINER).await })
            .await?;
        let doc = serde_json::json!({
            "id": format!("{}__run__{}", scenario, uuid::Uuid::new_v4()),
            "scenario": scenario,
            "run_id": run_id,
            "alert": alert,
            "attempts": attempts,
            "steps": steps,
            "outcome": outcome,
            "timestamp": Utc::now(),
        });
        self.store.upsert(HISTORY_CONTAINER, doc).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidentllm::runtime::StubRuntime;
    use crate::incidentllm::sse::TagFilter;
    use crate::incidentllm::store::MemoryStore;

    fn bridge_with(runtime: StubRuntime) -> (Arc<OrchestrationBridge>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(200, 256));
        let bridge = Arc::new(OrchestrationBridge::new(
            Arc::new(runtime),
            bus.clone(),
            Arc::new(MemoryStore::new()),
            "agent-id-map".to_string(),
        ));
        (bridge, bus)
    }

    /// Subscribe before submitting so the synchronous `run_start` publish
    /// is captured, then drain until the terminal event.
    async fn run_and_collect(
        bridge: &Arc<OrchestrationBridge>,
        bus: &EventBus,
        alert: &str,
    ) -> Vec<EventRecord> {
        let mut sub = bus.subscribe(TagFilter::Any);
        let source = bridge.clone().submit_alert(alert.to_string(), "demo".to_string());
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), sub.next())
                .await
                .expect("run did not terminate")
                .expect("subscription closed early");
            if event.source != source {
                continue;
            }
            let terminal = event.kind == "run_complete" || event.kind == "error";
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn successful_run_emits_ordered_dense_steps() {
        let (bridge, bus) = bridge_with(StubRuntime::new());
        let events = run_and_collect(
            &bridge,
            &bus,
            "CRITICAL: LINK-SYD-MEL-FIBRE-01 down at 14:31:14",
        )
        .await;

        assert_eq!(events.first().unwrap().kind, "run_start");
        assert_eq!(events.last().unwrap().kind, "run_complete");

        let step_indices: Vec<u64> = events
            .iter()
            .filter(|e| e.kind == "step_complete")
            .map(|e| e.payload["step_index"].as_u64().unwrap())
            .collect();
        assert_eq!(step_indices, vec![0, 1, 2, 3], "dense and monotonic");

        assert!(events.iter().any(|e| e.kind == "message"));
        let complete = events.last().unwrap();
        assert_eq!(complete.payload["steps"], 4);
        assert_eq!(complete.payload["attempts"], 1);
    }

    #[tokio::test]
    async fn failed_run_retries_on_same_thread_then_succeeds() {
        let runtime = Arc::new(StubRuntime::new().with_failed_runs(1));
        let bus = Arc::new(EventBus::new(200, 256));
        let bridge = Arc::new(OrchestrationBridge::new(
            runtime.clone(),
            bus.clone(),
            Arc::new(MemoryStore::new()),
            "agent-id-map".to_string(),
        ));

        let events = run_and_collect(&bridge, &bus, "alert").await;

        assert_eq!(events.last().unwrap().kind, "run_complete");
        assert_eq!(events.last().unwrap().payload["attempts"], 2);
        assert!(
            !events.iter().any(|e| e.kind == "error"),
            "no error event on a recovered run"
        );

        // One thread total, holding the alert plus the recovery message.
        let threads = runtime.thread_ids();
        assert_eq!(threads.len(), 1, "retry must reuse the thread");
        let messages = runtime.thread_messages(&threads[0]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "alert");
        assert!(messages[1].contains("Resume the"));

        // Step indices stay dense across the two attempts.
        let step_indices: Vec<u64> = events
            .iter()
            .filter(|e| e.kind == "step_complete")
            .map(|e| e.payload["step_index"].as_u64().unwrap())
            .collect();
        let expected: Vec<u64> = (0..step_indices.len() as u64).collect();
        assert_eq!(step_indices, expected);
    }

    #[tokio::test]
    async fn run_failing_both_attempts_emits_error() {
        let runtime = StubRuntime::new().with_failed_runs(2);
        let (bridge, bus) = bridge_with(runtime);
        let events = run_and_collect(&bridge, &bus, "alert").await;

        let last = events.last().unwrap();
        assert_eq!(last.kind, "error");
        assert!(last.payload["error"]
            .as_str()
            .unwrap()
            .contains("after 2 attempts"));
        assert!(!events.iter().any(|e| e.kind == "run_complete"));
    }

    #[tokio::test]
    async fn failing_sub_agent_degrades_not_fails() {
        let runtime = StubRuntime::new().with_failing_agent("runbook-knowledge");
        let (bridge, bus) = bridge_with(runtime);
        let events = run_and_collect(&bridge, &bus, "alert").await;

        let failed_steps: Vec<&EventRecord> = events
            .iter()
            .filter(|e| e.kind == "step_complete" && e.payload["error"] == true)
            .collect();
        assert_eq!(failed_steps.len(), 1);
        assert_eq!(failed_steps[0].payload["agent_name"], "runbook-knowledge");

        // Other sub-agents still ran, a partial report was produced, and
        // the run completed.
        assert_eq!(
            events.iter().filter(|e| e.kind == "step_complete").count(),
            4
        );
        assert!(events.iter().any(|e| e.kind == "message"));
        assert_eq!(events.last().unwrap().kind, "run_complete");
    }

    #[tokio::test]
    async fn history_is_recorded_for_terminated_runs() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(200, 256));
        let bridge = Arc::new(OrchestrationBridge::new(
            Arc::new(StubRuntime::new()),
            bus.clone(),
            store.clone(),
            "agent-id-map".to_string(),
        ));
        run_and_collect(&bridge, &bus, "alert text").await;

        // The history write races the terminal event slightly; give it a tick.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let runs = store
            .query(HISTORY_CONTAINER, &crate::incidentllm::store::DocQuery::all())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["outcome"], "complete");
        assert_eq!(runs[0]["alert"], "alert text");
    }
}
