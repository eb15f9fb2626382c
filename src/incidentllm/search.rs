//! Document-search store abstraction.
//!
//! Runbooks and tickets are uploaded into a blob-style container and
//! indexed by a search service; the provisioner later wires agents to the
//! index by name. [`MemorySearchStore`] keeps everything in memory for
//! tests and demo mode; [`RestSearchStore`] speaks the hosted search
//! service's REST surface.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::incidentllm::backends::common::get_shared_http_client;
use crate::incidentllm::credentials::TokenCredential;
use crate::incidentllm::error::{PlatformError, Result};

#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Control-plane: create the blob container if absent.
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Upload a document, overwriting any existing blob of the same name.
    async fn put_document(&self, container: &str, name: &str, content: &str) -> Result<()>;

    /// Create or update the search index pointing at a container.
    async fn ensure_index(&self, index_name: &str, container: &str) -> Result<()>;

    /// Names of the documents in a container.
    async fn list_documents(&self, container: &str) -> Result<Vec<String>>;
}

/// In-memory implementation for tests and demo mode.
pub struct MemorySearchStore {
    containers: Mutex<HashMap<String, HashMap<String, String>>>,
    indexes: Mutex<HashMap<String, String>>,
}

impl MemorySearchStore {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    /// Container an index points at, if the index exists.
    pub async fn index_target(&self, index_name: &str) -> Option<String> {
        self.indexes.lock().await.get(index_name).cloned()
    }

    pub async fn document(&self, container: &str, name: &str) -> Option<String> {
        self.containers
            .lock()
            .await
            .get(container)
            .and_then(|docs| docs.get(name))
            .cloned()
    }
}

impl Default for MemorySearchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchStore for MemorySearchStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        self.containers
            .lock()
            .await
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn put_document(&self, container: &str, name: &str, content: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let docs = containers.get_mut(container).ok_or_else(|| {
            PlatformError::resource_not_found(format!(
                "blob container '{}' does not exist",
                container
            ))
        })?;
        docs.insert(name.to_string(), content.to_string());
        Ok(())
    }

    async fn ensure_index(&self, index_name: &str, container: &str) -> Result<()> {
        self.indexes
            .lock()
            .await
            .insert(index_name.to_string(), container.to_string());
        Ok(())
    }

    async fn list_documents(&self, container: &str) -> Result<Vec<String>> {
        let containers = self.containers.lock().await;
        match containers.get(container) {
            Some(docs) => Ok(docs.keys().cloned().collect()),
            None => Err(PlatformError::resource_not_found(format!(
                "blob container '{}' does not exist",
                container
            ))),
        }
    }
}

/// REST implementation against the hosted search service.
pub struct RestSearchStore {
    endpoint: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
}

impl RestSearchStore {
    pub fn new(endpoint: String, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            scope: "https://search.azure.com/.default".to_string(),
            credential,
        }
    }
}

#[async_trait]
impl SearchStore for RestSearchStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        let token = self.credential.token(&self.scope).await?;
        let response = get_shared_http_client()
            .put(format!("{}/containers/{}", self.endpoint, container))
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status().is_success() || response.status().as_u16() == 409 {
            Ok(())
        } else {
            Err(PlatformError::upstream(format!(
                "container create for '{}' failed ({})",
                container,
                response.status()
            )))
        }
    }

    async fn put_document(&self, container: &str, name: &str, content: &str) -> Result<()> {
        let token = self.credential.token(&self.scope).await?;
        let response = get_shared_http_client()
            .put(format!(
                "{}/containers/{}/blobs/{}",
                self.endpoint,
                container,
                urlencoding::encode(name)
            ))
            .bearer_auth(&token)
            .header("x-ms-overwrite", "true")
            .body(content.to_string())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PlatformError::upstream(format!(
                "blob upload '{}' failed ({})",
                name,
                response.status()
            )))
        }
    }

    async fn ensure_index(&self, index_name: &str, container: &str) -> Result<()> {
        let token = self.credential.token(&self.scope).await?;
        let body = serde_json::json!({
            "name": index_name,
            "dataSource": { "container": container },
        });
        let response = get_shared_http_client()
            .put(format!("{}/indexes/{}", self.endpoint, index_name))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(PlatformError::upstream(format!(
                "index build for '{}' failed ({})",
                index_name,
                response.status()
            )))
        }
    }

    async fn list_documents(&self, container: &str) -> Result<Vec<String>> {
        let token = self.credential.token(&self.scope).await?;
        let response = get_shared_http_client()
            .get(format!("{}/containers/{}/blobs", self.endpoint, container))
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(PlatformError::resource_not_found(format!(
                "blob container '{}' does not exist",
                container
            )));
        }
        let body: serde_json::Value = response.json().await.map_err(PlatformError::from)?;
        Ok(body
            .get("blobs")
            .and_then(|b| b.as_array())
            .map(|blobs| {
                blobs
                    .iter()
                    .filter_map(|b| b.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_requires_container() {
        let store = MemorySearchStore::new();
        let err = store.put_document("c", "doc.md", "body").await.unwrap_err();
        assert_eq!(err.kind(), "resource_not_found");

        store.ensure_container("c").await.unwrap();
        store.put_document("c", "doc.md", "body").await.unwrap();
        assert_eq!(store.document("c", "doc.md").await.unwrap(), "body");
    }

    #[tokio::test]
    async fn put_overwrites_existing_document() {
        let store = MemorySearchStore::new();
        store.ensure_container("c").await.unwrap();
        store.put_document("c", "doc.md", "v1").await.unwrap();
        store.put_document("c", "doc.md", "v2").await.unwrap();
        assert_eq!(store.document("c", "doc.md").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn index_points_at_container() {
        let store = MemorySearchStore::new();
        store.ensure_container("s-runbooks").await.unwrap();
        store
            .ensure_index("s-runbooks-index", "s-runbooks")
            .await
            .unwrap();
        assert_eq!(
            store.index_target("s-runbooks-index").await.unwrap(),
            "s-runbooks"
        );
    }
}
