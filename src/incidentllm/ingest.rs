//! Ingestion pipeline for scenario data packs.
//!
//! Accepts a gzipped tar archive for one of five upload kinds, validates it
//! against its declared manifest, upserts data into the matching external
//! store, and streams `progress`/`complete`/`error` events through the SSE
//! substrate.
//!
//! Validation is front-loaded: a missing or unparseable manifest, or a
//! referenced CSV that is absent or missing declared columns, fails the
//! upload before any resource is touched. Partial data-plane failures emit
//! `error` with the counts so far and stop; re-running the upload recovers
//! through upsert semantics.
//!
//! # Scenario-name override
//!
//! Every upload endpoint accepts an optional `scenario_name` parameter.
//! When present it is authoritative: it wins over any name embedded in the
//! archive's manifest, uniformly across all five kinds.

use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use crate::incidentllm::backend::{GraphEdge, GraphVertex, IngestOptions};
use crate::incidentllm::context::ContextResolver;
use crate::incidentllm::error::{PlatformError, Result};
use crate::incidentllm::registry::BackendRegistry;
use crate::incidentllm::scenario::{validate_scenario_name, ScenarioRegistry};
use crate::incidentllm::search::SearchStore;
use crate::incidentllm::sse::{EventBus, EventRecord};
use crate::incidentllm::store::{DocumentStore, PROMPTS_CONTAINER};

/// The five archive kinds the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Graph,
    Telemetry,
    Runbooks,
    Tickets,
    Prompts,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Graph => "graph",
            UploadKind::Telemetry => "telemetry",
            UploadKind::Runbooks => "runbooks",
            UploadKind::Tickets => "tickets",
            UploadKind::Prompts => "prompts",
        }
    }
}

impl FromStr for UploadKind {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "graph" => Ok(UploadKind::Graph),
            "telemetry" => Ok(UploadKind::Telemetry),
            "runbooks" => Ok(UploadKind::Runbooks),
            "tickets" => Ok(UploadKind::Tickets),
            "prompts" => Ok(UploadKind::Prompts),
            other => Err(PlatformError::validation(format!(
                "unknown upload kind '{}'; expected graph, telemetry, runbooks, tickets, or prompts",
                other
            ))),
        }
    }
}

/// Extracted archive: normalized relative path -> file bytes.
type ArchiveFiles = HashMap<String, Vec<u8>>;

/// Unpack a gzipped tar archive into memory.
pub fn extract_archive(bytes: &[u8]) -> Result<ArchiveFiles> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    let mut files = HashMap::new();
    let entries = archive
        .entries()
        .map_err(|e| PlatformError::validation(format!("archive is not a gzipped tar: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| PlatformError::validation(format!("malformed archive entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| PlatformError::validation(format!("bad path in archive: {}", e)))?
            .to_string_lossy()
            .trim_start_matches("./")
            .to_string();
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .map_err(|e| PlatformError::validation(format!("archive read failed: {}", e)))?;
        files.insert(path, content);
    }
    if files.is_empty() {
        return Err(PlatformError::validation("archive contains no files"));
    }
    Ok(files)
}

#[derive(Debug, Deserialize)]
struct FileDecl {
    label: String,
    file: String,
    #[serde(default)]
    columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GraphManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    drop_existing: bool,
    vertices: Vec<FileDecl>,
    edges: Vec<FileDecl>,
}

#[derive(Debug, Deserialize)]
struct TelemetryContainerDecl {
    name: String,
    file: String,
    #[serde(default)]
    numeric_columns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TelemetryManifest {
    #[serde(default)]
    name: Option<String>,
    containers: Vec<TelemetryContainerDecl>,
}

#[derive(Debug, Default, Deserialize)]
struct PlainManifest {
    #[serde(default)]
    name: Option<String>,
}

fn parse_manifest<T: serde::de::DeserializeOwned>(files: &ArchiveFiles) -> Result<T> {
    let raw = files.get("manifest.json").ok_or_else(|| {
        PlatformError::validation("archive is missing manifest.json")
    })?;
    serde_json::from_slice(raw)
        .map_err(|e| PlatformError::validation(format!("manifest.json does not parse: {}", e)))
}

/// Streaming upload processor. One instance per process, shared state with
/// the request surface.
pub struct IngestPipeline {
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn SearchStore>,
    registry: Arc<BackendRegistry>,
    resolver: Arc<ContextResolver>,
    scenarios: Arc<ScenarioRegistry>,
    bus: Arc<EventBus>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchStore>,
        registry: Arc<BackendRegistry>,
        resolver: Arc<ContextResolver>,
        scenarios: Arc<ScenarioRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            search,
            registry,
            resolver,
            scenarios,
            bus,
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

    /// Process one upload end to end, publishing events at `source`.
    pub async fn run_upload(
        &self,
        kind: UploadKind,
        scenario_override: Option<String>,
        archive: Vec<u8>,
        source: &str,
    ) {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let result = self
            .execute(kind, scenario_override, archive, source, &mut counts)
            .await;
        match result {
            Ok(scenario) => {
                self.bus.publish(
                    source,
                    EventRecord::complete(serde_json::json!({ "counts": counts })),
                );
                if let Err(e) = self
                    .scenarios
                    .record_upload(&scenario, kind.as_str(), "complete", counts)
                    .await
                {
                    log::warn!("upload status write for '{}' failed: {}", scenario, e);
                }
            }
            Err(e) => {
                log::error!("{} upload failed: {}", kind.as_str(), e);
                self.bus.publish(
                    source,
                    EventRecord::of(
                        crate::incidentllm::sse::KIND_ERROR,
                        serde_json::json!({
                            "error": e.to_string(),
                            "kind": e.kind(),
                            "counts_so_far": counts,
                        }),
                    ),
                );
            }
        }
    }

    async fn execute(
        &self,
        kind: UploadKind,
        scenario_override: Option<String>,
        archive: Vec<u8>,
        source: &str,
        counts: &mut HashMap<String, u64>,
    ) -> Result<String> {
        self.progress(source, "extracting", "unpacking archive".to_string(), 5);
        let files = extract_archive(&archive)?;

        match kind {
            UploadKind::Graph => self.ingest_graph(scenario_override, files, source, counts).await,
            UploadKind::Telemetry => {
                self.ingest_telemetry(scenario_override, files, source, counts)
                    .await
            }
            UploadKind::Runbooks => {
                self.ingest_documents(scenario_override, files, source, counts, "runbooks")
                    .await
            }
            UploadKind::Tickets => {
                self.ingest_documents(scenario_override, files, source, counts, "tickets")
                    .await
            }
            UploadKind::Prompts => {
                self.ingest_prompts(scenario_override, files, source, counts)
                    .await
            }
        }
    }

    /// The override wins over the manifest everywhere; the manifest name is
    /// only a fallback.
    fn resolve_name(override_name: Option<String>, manifest_name: Option<String>) -> Result<String> {
        let name = override_name.or(manifest_name).ok_or_else(|| {
            PlatformError::validation(
                "no scenario name: pass ?scenario_name=... or declare one in the manifest",
            )
        })?;
        validate_scenario_name(&name)?;
        Ok(name)
    }

    async fn ingest_graph(
        &self,
        scenario_override: Option<String>,
        files: ArchiveFiles,
        source: &str,
        counts: &mut HashMap<String, u64>,
    ) -> Result<String> {
        let manifest: GraphManifest = parse_manifest(&files)?;
        let scenario = Self::resolve_name(scenario_override, manifest.name.clone())?;

        // Validate every referenced CSV before touching any resource.
        self.progress(source, "validating", "checking schema manifest".to_string(), 10);
        for decl in manifest.vertices.iter().chain(manifest.edges.iter()) {
            let raw = files.get(&decl.file).ok_or_else(|| {
                PlatformError::validation(format!(
                    "manifest references '{}' but the archive does not contain it",
                    decl.file
                ))
            })?;
            verify_columns(&decl.file, raw, &decl.columns)?;
        }

        let mut vertices = Vec::new();
        for decl in &manifest.vertices {
            vertices.extend(read_vertices(&files[&decl.file], &decl.label)?);
        }
        let mut edges = Vec::new();
        for decl in &manifest.edges {
            edges.extend(read_edges(&files[&decl.file], &decl.label)?);
        }

        // The `-topology` suffix is the same hardcoded convention the
        // scenario-context resolver splits on at read time. If a manifest
        // declared some other suffix we would write data the resolver can
        // never route a query to, so the manifest gets no say here.
        let graph_name = format!("{}-topology", scenario);
        self.progress(
            source,
            "creating_graph",
            format!("ensuring graph '{}' exists", graph_name),
            20,
        );
        let context = self.resolver.resolve(Some(&graph_name)).await;
        let backend = self.registry.resolve(&context).await?;

        let bus = self.bus.clone();
        let progress_source = source.to_string();
        let progress: crate::incidentllm::backend::IngestProgress =
            Arc::new(move |phase: &str, done: usize, total: usize| {
                // Vertices span 20-60%, edges 60-90% of the bar.
                let pct = match phase {
                    "vertices" => 20 + (done * 40 / total.max(1)) as u8,
                    _ => 60 + (done * 30 / total.max(1)) as u8,
                };
                bus.publish(
                    &progress_source,
                    EventRecord::progress(serde_json::json!({
                        "step": format!("ingesting_{}", phase),
                        "detail": format!("{}/{}", done, total),
                        "pct": pct,
                    })),
                );
            });

        let report = backend
            .ingest(
                vertices,
                edges,
                &IngestOptions {
                    graph_name,
                    graph_database: context.graph_database.clone(),
                    drop_first: manifest.drop_existing,
                    progress: Some(progress),
                },
            )
            .await?;
        counts.insert("vertices".to_string(), report.vertices as u64);
        counts.insert("edges".to_string(), report.edges as u64);
        Ok(scenario)
    }

    async fn ingest_telemetry(
        &self,
        scenario_override: Option<String>,
        files: ArchiveFiles,
        source: &str,
        counts: &mut HashMap<String, u64>,
    ) -> Result<String> {
        let manifest: TelemetryManifest = parse_manifest(&files)?;
        let scenario = Self::resolve_name(scenario_override, manifest.name.clone())?;

        for decl in &manifest.containers {
            if !files.contains_key(&decl.file) {
                return Err(PlatformError::validation(format!(
                    "manifest references '{}' but the archive does not contain it",
                    decl.file
                )));
            }
        }

        let container_total = manifest.containers.len();
        for (container_index, decl) in manifest.containers.iter().enumerate() {
            // Same coupling as the graph path: the resolver prefixes
            // telemetry containers with the scenario name at query time.
            let container = format!("{}-{}", scenario, decl.name);
            self.progress(
                source,
                "creating_container",
                container.clone(),
                (10 + container_index * 80 / container_total.max(1)) as u8,
            );
            self.store.ensure_container(&container).await?;

            let rows = read_telemetry_rows(&files[&decl.file], &decl.numeric_columns)?;
            let total = rows.len();
            for (index, row) in rows.into_iter().enumerate() {
                self.store.upsert(&container, row).await?;
                *counts.entry(decl.name.clone()).or_insert(0) += 1;
                if (index + 1) % 100 == 0 {
                    self.progress(
                        source,
                        "upserting_rows",
                        format!("{}: {}/{}", decl.name, index + 1, total),
                        (10 + (container_index * 80 + (index + 1) * 80 / total.max(1))
                            / container_total.max(1)) as u8,
                    );
                }
            }
        }
        Ok(scenario)
    }

    async fn ingest_documents(
        &self,
        scenario_override: Option<String>,
        files: ArchiveFiles,
        source: &str,
        counts: &mut HashMap<String, u64>,
        category: &str,
    ) -> Result<String> {
        let manifest: PlainManifest = match files.get("manifest.json") {
            Some(raw) => serde_json::from_slice(raw)
                .map_err(|e| PlatformError::validation(format!("manifest.json does not parse: {}", e)))?,
            None => PlainManifest::default(),
        };
        let scenario = Self::resolve_name(scenario_override, manifest.name)?;

        let container = format!("{}-{}", scenario, category);
        self.progress(
            source,
            "creating_container",
            format!("ensuring blob container '{}'", container),
            10,
        );
        self.search.ensure_container(&container).await?;

        let documents: Vec<(&String, &Vec<u8>)> = files
            .iter()
            .filter(|(path, _)| path.as_str() != "manifest.json")
            .collect();
        if documents.is_empty() {
            return Err(PlatformError::validation(format!(
                "{} archive contains no documents",
                category
            )));
        }
        let total = documents.len();
        for (index, (path, content)) in documents.into_iter().enumerate() {
            let text = String::from_utf8_lossy(content);
            self.search.put_document(&container, path, &text).await?;
            *counts.entry("documents".to_string()).or_insert(0) += 1;
            self.progress(
                source,
                "uploading_documents",
                format!("{}/{}", index + 1, total),
                (10 + (index + 1) * 70 / total) as u8,
            );
        }

        let index_name = format!("{}-{}-index", scenario, category);
        self.progress(source, "building_index", index_name.clone(), 90);
        self.search.ensure_index(&index_name, &container).await?;
        Ok(scenario)
    }

    async fn ingest_prompts(
        &self,
        scenario_override: Option<String>,
        files: ArchiveFiles,
        source: &str,
        counts: &mut HashMap<String, u64>,
    ) -> Result<String> {
        let manifest: PlainManifest = match files.get("manifest.json") {
            Some(raw) => serde_json::from_slice(raw)
                .map_err(|e| PlatformError::validation(format!("manifest.json does not parse: {}", e)))?,
            None => PlainManifest::default(),
        };
        let scenario = Self::resolve_name(scenario_override, manifest.name)?;

        // Group markdown files by agent: `orchestrator/core.md` and
        // `orchestrator.md` both belong to agent `orchestrator`.
        let mut by_agent: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (path, content) in &files {
            if path == "manifest.json" || !path.ends_with(".md") {
                continue;
            }
            let agent = match path.split_once('/') {
                Some((dir, _)) => dir.to_string(),
                None => path.trim_end_matches(".md").to_string(),
            };
            by_agent
                .entry(agent)
                .or_default()
                .push((path.clone(), String::from_utf8_lossy(content).into_owned()));
        }
        if by_agent.is_empty() {
            return Err(PlatformError::validation(
                "prompts archive contains no markdown files",
            ));
        }

        self.progress(source, "creating_container", PROMPTS_CONTAINER.to_string(), 10);
        self.store.ensure_container(PROMPTS_CONTAINER).await?;

        let total = by_agent.len();
        for (index, (agent, mut fragments)) in by_agent.into_iter().enumerate() {
            fragments.sort_by(|a, b| a.0.cmp(&b.0));
            let content = fragments
                .into_iter()
                .map(|(_, text)| text)
                .collect::<Vec<_>>()
                .join("\n\n");
            let doc = serde_json::json!({
                "id": format!("{}__{}__v1", scenario, agent),
                "agent": agent,
                "scenario": scenario,
                "version": 1,
                "content": content,
                "timestamp": chrono::Utc::now(),
            });
            self.store.upsert(PROMPTS_CONTAINER, doc).await?;
            *counts.entry("prompts".to_string()).or_insert(0) += 1;
            self.progress(
                source,
                "upserting_prompts",
                format!("{}/{}", index + 1, total),
                (10 + (index + 1) * 80 / total) as u8,
            );
        }
        Ok(scenario)
    }
}

fn verify_columns(file: &str, raw: &[u8], declared: &[String]) -> Result<()> {
    let mut reader = csv::Reader::from_reader(raw);
    let headers = reader
        .headers()
        .map_err(|e| PlatformError::validation(format!("{}: {}", file, e)))?;
    for column in declared {
        if !headers.iter().any(|h| h == column) {
            return Err(PlatformError::validation(format!(
                "{} is missing declared column '{}'",
                file, column
            )));
        }
    }
    Ok(())
}

fn read_vertices(raw: &[u8], label: &str) -> Result<Vec<GraphVertex>> {
    let mut reader = csv::Reader::from_reader(raw);
    let headers = reader
        .headers()
        .map_err(|e| PlatformError::validation(e.to_string()))?
        .clone();
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PlatformError::validation(e.to_string()))?;
        let mut id = None;
        let mut properties = HashMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            if header == "id" {
                id = Some(field.to_string());
            } else {
                properties.insert(
                    header.to_string(),
                    serde_json::Value::String(field.to_string()),
                );
            }
        }
        out.push(GraphVertex {
            id: id.ok_or_else(|| PlatformError::validation("vertex row is missing 'id'"))?,
            label: label.to_string(),
            properties,
        });
    }
    Ok(out)
}

fn read_edges(raw: &[u8], label: &str) -> Result<Vec<GraphEdge>> {
    let mut reader = csv::Reader::from_reader(raw);
    let headers = reader
        .headers()
        .map_err(|e| PlatformError::validation(e.to_string()))?
        .clone();
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PlatformError::validation(e.to_string()))?;
        let mut fields: HashMap<&str, String> = HashMap::new();
        let mut properties = HashMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            match header {
                "id" | "source" | "target" => {
                    fields.insert(header, field.to_string());
                }
                _ => {
                    properties.insert(
                        header.to_string(),
                        serde_json::Value::String(field.to_string()),
                    );
                }
            }
        }
        let take = |key: &str| -> Result<String> {
            fields
                .get(key)
                .cloned()
                .ok_or_else(|| PlatformError::validation(format!("edge row is missing '{}'", key)))
        };
        out.push(GraphEdge {
            id: take("id")?,
            label: label.to_string(),
            source: take("source")?,
            target: take("target")?,
            properties,
        });
    }
    Ok(out)
}

fn read_telemetry_rows(raw: &[u8], numeric_columns: &[String]) -> Result<Vec<serde_json::Value>> {
    let mut reader = csv::Reader::from_reader(raw);
    let headers = reader
        .headers()
        .map_err(|e| PlatformError::validation(e.to_string()))?
        .clone();
    let mut out = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PlatformError::validation(e.to_string()))?;
        let mut object = serde_json::Map::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            let value = if numeric_columns.iter().any(|c| c == header) {
                field
                    .parse::<f64>()
                    .map(|n| {
                        serde_json::Number::from_f64(n)
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .unwrap_or(serde_json::Value::Null)
            } else {
                serde_json::Value::String(field.to_string())
            };
            object.insert(header.to_string(), value);
        }
        // Rows without a natural id get a positional one so re-runs upsert
        // instead of duplicating.
        if !object.contains_key("id") {
            object.insert(
                "id".to_string(),
                serde_json::Value::String(format!("row-{}", index)),
            );
        }
        out.push(serde_json::Value::Object(object));
    }
    Ok(out)
}
