//! Scenario registry and lifecycle.
//!
//! A scenario is a named bundle of graph data, telemetry, two search
//! indexes, and a prompt set. The registry owns the scenario documents; no
//! other component upserts them. Deleting a scenario removes the registry
//! record ONLY; the underlying data resources stay intact, which keeps
//! delete safe and fast.
//!
//! # Naming
//!
//! Names are lowercase alphanumerics and hyphens, 2 to 50 characters, no
//! consecutive hyphens, and must not end in a reserved resource suffix.
//! Resource names are then deterministic: scenario `telco-noc` owns graph
//! `telco-noc-topology`, indexes `telco-noc-runbooks-index` and
//! `telco-noc-tickets-index`, and prompt documents keyed under `telco-noc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::incidentllm::error::{PlatformError, Result};
use crate::incidentllm::store::{DocumentStore, SCENARIOS_CONTAINER};

/// Suffixes reserved for derived resource names. A scenario name ending in
/// one of these would collide with the resources of another scenario.
pub const RESERVED_SUFFIXES: [&str; 5] = [
    "-topology",
    "-telemetry",
    "-prompts",
    "-runbooks",
    "-tickets",
];

/// Validate a scenario name against the naming rules.
pub fn validate_scenario_name(name: &str) -> Result<()> {
    if name.len() < 2 || name.len() > 50 {
        return Err(PlatformError::validation(format!(
            "scenario name '{}' must be 2-50 characters",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(PlatformError::validation(format!(
            "scenario name '{}' may only contain lowercase letters, digits, and hyphens",
            name
        )));
    }
    let first = name.chars().next().unwrap_or('-');
    let last = name.chars().last().unwrap_or('-');
    if first == '-' || last == '-' {
        return Err(PlatformError::validation(format!(
            "scenario name '{}' must start and end with a letter or digit",
            name
        )));
    }
    if name.contains("--") {
        return Err(PlatformError::validation(format!(
            "scenario name '{}' must not contain consecutive hyphens",
            name
        )));
    }
    for suffix in RESERVED_SUFFIXES {
        if name.ends_with(suffix) {
            return Err(PlatformError::validation(format!(
                "scenario name '{}' ends with reserved suffix '{}'",
                name, suffix
            )));
        }
    }
    Ok(())
}

/// Deterministic resource names for a scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioResources {
    pub graph: String,
    pub telemetry: String,
    pub runbooks_index: String,
    pub tickets_index: String,
    pub prompts: String,
}

impl ScenarioResources {
    pub fn for_name(name: &str) -> Self {
        Self {
            graph: format!("{}-topology", name),
            telemetry: format!("{}-telemetry", name),
            runbooks_index: format!("{}-runbooks-index", name),
            tickets_index: format!("{}-tickets-index", name),
            prompts: name.to_string(),
        }
    }
}

/// Outcome of one upload kind, kept on the scenario record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub counts: HashMap<String, u64>,
}

/// A scenario registry document. Invariant: `id == name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: String,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resources: ScenarioResources,
    #[serde(default)]
    pub upload_status: HashMap<String, UploadStatus>,
}

/// Save request from the UI.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveScenarioRequest {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

/// CRUD surface over the scenario container.
pub struct ScenarioRegistry {
    store: Arc<dyn DocumentStore>,
    // The registry container is created once, on the first write of any
    // kind; reads never touch the control plane.
    container_ready: OnceCell<()>,
}

impl ScenarioRegistry {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            container_ready: OnceCell::new(),
        }
    }

    async fn ensure_container(&self) -> Result<()> {
        self.container_ready
            .get_or_try_init(|| async {
                self.store.ensure_container(SCENARIOS_CONTAINER).await
            })
            .await?;
        Ok(())
    }

    /// All saved scenarios, most recently updated first. An absent registry
    /// container means nothing was ever saved. That is an empty list, not
    /// an error.
    pub async fn list(&self) -> Result<Vec<ScenarioRecord>> {
        let docs = match self
            .store
            .query(SCENARIOS_CONTAINER, &crate::incidentllm::store::DocQuery::all())
            .await
        {
            Ok(docs) => docs,
            Err(PlatformError::ResourceNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records: Vec<ScenarioRecord> = docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    pub async fn get(&self, name: &str) -> Result<Option<ScenarioRecord>> {
        match self.store.get(SCENARIOS_CONTAINER, name).await {
            Ok(Some(doc)) => Ok(serde_json::from_value(doc).ok()),
            Ok(None) => Ok(None),
            Err(PlatformError::ResourceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Upsert a scenario. Saving an existing name overwrites it in place;
    /// the UI shows the confirmation dialog, not this layer.
    pub async fn save(&self, request: SaveScenarioRequest) -> Result<ScenarioRecord> {
        validate_scenario_name(&request.name)?;
        self.ensure_container().await?;

        let existing = self.get(&request.name).await?;
        let now = Utc::now();
        let record = ScenarioRecord {
            id: request.name.clone(),
            name: request.name.clone(),
            display_name: request.display_name,
            description: request.description,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
            resources: ScenarioResources::for_name(&request.name),
            upload_status: existing.map(|r| r.upload_status).unwrap_or_default(),
        };
        self.store
            .upsert(SCENARIOS_CONTAINER, serde_json::to_value(&record)?)
            .await?;
        log::info!("saved scenario '{}'", record.name);
        Ok(record)
    }

    /// Delete the registry record only. Returns `resource_not_found` when
    /// the scenario was never saved.
    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_scenario_name(name)?;
        let removed = match self.store.delete(SCENARIOS_CONTAINER, name).await {
            Ok(removed) => removed,
            Err(PlatformError::ResourceNotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if removed {
            log::info!("deleted scenario record '{}' (data resources left intact)", name);
            Ok(())
        } else {
            Err(PlatformError::resource_not_found(format!(
                "scenario '{}' is not saved",
                name
            )))
        }
    }

    /// Record the outcome of one upload kind on the scenario. Creates a
    /// minimal record when data is uploaded before the scenario is saved.
    pub async fn record_upload(
        &self,
        name: &str,
        kind: &str,
        status: &str,
        counts: HashMap<String, u64>,
    ) -> Result<()> {
        validate_scenario_name(name)?;
        self.ensure_container().await?;

        let mut record = match self.get(name).await? {
            Some(record) => record,
            None => {
                let now = Utc::now();
                ScenarioRecord {
                    id: name.to_string(),
                    name: name.to_string(),
                    display_name: name.to_string(),
                    description: String::new(),
                    created_at: now,
                    updated_at: now,
                    resources: ScenarioResources::for_name(name),
                    upload_status: HashMap::new(),
                }
            }
        };
        record.updated_at = Utc::now();
        record.upload_status.insert(
            kind.to_string(),
            UploadStatus {
                status: status.to_string(),
                timestamp: Utc::now(),
                counts,
            },
        );
        self.store
            .upsert(SCENARIOS_CONTAINER, serde_json::to_value(&record)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incidentllm::store::MemoryStore;

    fn registry() -> ScenarioRegistry {
        ScenarioRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn name_validation_boundaries() {
        assert!(validate_scenario_name("a").is_err(), "length 1 rejected");
        assert!(validate_scenario_name("ab").is_ok());
        let fifty = "a".repeat(50);
        assert!(validate_scenario_name(&fifty).is_ok(), "length 50 accepted");
        let fifty_one = "a".repeat(51);
        assert!(validate_scenario_name(&fifty_one).is_err());
    }

    #[test]
    fn name_validation_shape() {
        assert!(validate_scenario_name("a--b").is_err(), "consecutive hyphens");
        assert!(validate_scenario_name("-ab").is_err());
        assert!(validate_scenario_name("ab-").is_err());
        assert!(validate_scenario_name("Telco").is_err(), "uppercase");
        assert!(validate_scenario_name("telco_noc").is_err(), "underscore");
        assert!(validate_scenario_name("telco-noc-42").is_ok());
    }

    #[test]
    fn reserved_suffixes_rejected() {
        assert!(validate_scenario_name("foo-topology").is_err());
        assert!(validate_scenario_name("foo-telemetry").is_err());
        assert!(validate_scenario_name("foo-prompts").is_err());
        assert!(validate_scenario_name("foo-runbooks").is_err());
        assert!(validate_scenario_name("foo-tickets").is_err());
        assert!(validate_scenario_name("topology").is_ok(), "bare word is fine");
    }

    #[tokio::test]
    async fn save_then_list_round_trips() {
        let registry = registry();
        registry
            .save(SaveScenarioRequest {
                name: "telco-noc".to_string(),
                display_name: "Telco NOC".to_string(),
                description: "demo".to_string(),
            })
            .await
            .unwrap();

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "telco-noc");
        assert_eq!(listed[0].resources.graph, "telco-noc-topology");
        assert_eq!(listed[0].resources.runbooks_index, "telco-noc-runbooks-index");
    }

    #[tokio::test]
    async fn save_twice_is_upsert_preserving_created_at() {
        let registry = registry();
        let first = registry
            .save(SaveScenarioRequest {
                name: "telco-noc".to_string(),
                display_name: "v1".to_string(),
                description: String::new(),
            })
            .await
            .unwrap();
        let second = registry
            .save(SaveScenarioRequest {
                name: "telco-noc".to_string(),
                display_name: "v2".to_string(),
                description: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(second.display_name, "v2");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_is_sorted_by_updated_at_descending() {
        let registry = registry();
        for name in ["first", "second", "third"] {
            registry
                .save(SaveScenarioRequest {
                    name: name.to_string(),
                    display_name: name.to_string(),
                    description: String::new(),
                })
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let listed = registry.list().await.unwrap();
        assert_eq!(listed[0].name, "third");
        assert_eq!(listed[2].name, "first");
    }

    #[tokio::test]
    async fn delete_removes_record_only() {
        let registry = registry();
        registry
            .save(SaveScenarioRequest {
                name: "gone".to_string(),
                display_name: "Gone".to_string(),
                description: String::new(),
            })
            .await
            .unwrap();
        registry.delete("gone").await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());

        let err = registry.delete("gone").await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");
    }

    #[tokio::test]
    async fn list_before_any_save_is_empty() {
        assert!(registry().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_upload_creates_minimal_record() {
        let registry = registry();
        registry
            .record_upload(
                "fresh",
                "graph",
                "complete",
                HashMap::from([("vertices".to_string(), 42u64)]),
            )
            .await
            .unwrap();
        let record = registry.get("fresh").await.unwrap().unwrap();
        assert_eq!(record.upload_status["graph"].status, "complete");
        assert_eq!(record.upload_status["graph"].counts["vertices"], 42);
    }
}
