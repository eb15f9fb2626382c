//! Backend registry and dispatch.
//!
//! The registry owns every backend instance in the process. Lookups go
//! through [`BackendRegistry::resolve`]; direct instantiation outside this
//! module is forbidden so the cache invariant holds: concurrent lookups on
//! the same `{backend_type}:{graph_name}` key produce exactly one instance.
//!
//! # Example
//!
//! ```rust
//! use incidentllm::registry::BackendRegistry;
//! use incidentllm::config::PlatformConfig;
//! use incidentllm::context::ScenarioContext;
//!
//! # #[tokio::main] async fn main() {
//! let registry = BackendRegistry::from_config(&PlatformConfig::default());
//! let context = ScenarioContext::default_for(&PlatformConfig::default());
//! let backend = registry.resolve(&context).await.unwrap();
//! assert_eq!(backend.kind(), incidentllm::backend::BackendKind::Mock);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::incidentllm::backend::{BackendKind, GraphBackend};
use crate::incidentllm::backends::cosmos_sql::CosmosSqlBackend;
use crate::incidentllm::backends::fabric::FabricGqlBackend;
use crate::incidentllm::backends::gremlin::GremlinBackend;
use crate::incidentllm::backends::kusto::KustoBackend;
use crate::incidentllm::backends::mock::MockBackend;
use crate::incidentllm::config::PlatformConfig;
use crate::incidentllm::context::ScenarioContext;
use crate::incidentllm::credentials::global_credential;
use crate::incidentllm::error::{PlatformError, Result};

/// Factory building a backend instance for a graph name.
pub type BackendFactory = Box<dyn Fn(&str) -> Result<Arc<dyn GraphBackend>> + Send + Sync>;

struct CacheEntry {
    backend: Arc<dyn GraphBackend>,
    last_used: Instant,
}

/// Process-wide backend registry with a `{kind}:{graph}`-keyed cache.
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl BackendRegistry {
    /// Registry with no factories. Used by tests that register their own.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the standard factories from platform configuration. Backends
    /// with missing variables stay registered; their factory fails with
    /// `config_missing` at query time, where the caller can read it.
    pub fn from_config(config: &PlatformConfig) -> Self {
        let mut registry = Self::empty();

        let default_graph = config.default_graph_name();
        registry.register(
            BackendKind::Mock,
            Box::new(move |graph_name| {
                // The default demo graph comes pre-seeded so the platform
                // answers queries with zero setup.
                if graph_name == default_graph {
                    Ok(Arc::new(MockBackend::with_fixture()))
                } else {
                    Ok(Arc::new(MockBackend::empty()))
                }
            }),
        );

        let gremlin = config.gremlin.clone();
        registry.register(
            BackendKind::Gremlin,
            Box::new(move |_| Ok(Arc::new(GremlinBackend::new(&gremlin)?))),
        );

        let fabric = config.fabric.clone();
        let fabric_credentials = config.credentials.clone();
        registry.register(
            BackendKind::FabricGql,
            Box::new(move |_| {
                let credential = global_credential(&fabric_credentials);
                Ok(Arc::new(FabricGqlBackend::new(&fabric, credential)?))
            }),
        );

        let kusto = config.kusto.clone();
        let kusto_credentials = config.credentials.clone();
        registry.register(
            BackendKind::Kusto,
            Box::new(move |_| {
                let credential = global_credential(&kusto_credentials);
                Ok(Arc::new(KustoBackend::new(&kusto, credential)?))
            }),
        );

        let cosmos = config.cosmos.clone();
        let cosmos_credentials = config.credentials.clone();
        registry.register(
            BackendKind::CosmosSql,
            Box::new(move |_| {
                let credential = global_credential(&cosmos_credentials);
                Ok(Arc::new(CosmosSqlBackend::new(&cosmos, credential)?))
            }),
        );

        registry
    }

    /// Register (or replace) the factory for a backend kind.
    pub fn register(&mut self, kind: BackendKind, factory: BackendFactory) {
        self.factories.insert(kind, factory);
    }

    fn cache_key(kind: BackendKind, graph_name: &str) -> String {
        format!("{}:{}", kind, graph_name)
    }

    /// Resolve the backend for a scenario context, instantiating on first
    /// use. The cache mutex is held across miss resolution: construction
    /// is synchronous, so the critical section stays short and concurrent
    /// misses on one key can never double-instantiate.
    pub async fn resolve(&self, context: &ScenarioContext) -> Result<Arc<dyn GraphBackend>> {
        let key = Self::cache_key(context.backend_type, &context.graph_name);
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get_mut(&key) {
            entry.last_used = Instant::now();
            return Ok(entry.backend.clone());
        }

        let factory = self.factories.get(&context.backend_type).ok_or_else(|| {
            PlatformError::config_missing(format!(
                "no factory registered for backend '{}'",
                context.backend_type
            ))
        })?;
        let backend = factory(&context.graph_name)?;
        log::info!(
            "instantiated backend {} for graph '{}'",
            context.backend_type,
            context.graph_name
        );
        cache.insert(
            key,
            CacheEntry {
                backend: backend.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(backend)
    }

    /// Close and drop a cached instance.
    pub async fn evict(&self, kind: BackendKind, graph_name: &str) -> Result<()> {
        let key = Self::cache_key(kind, graph_name);
        let entry = self.cache.lock().await.remove(&key);
        if let Some(entry) = entry {
            entry.backend.close().await?;
        }
        Ok(())
    }

    /// Close every cached backend. Called on process shutdown.
    pub async fn shutdown(&self) {
        let entries: Vec<CacheEntry> = {
            let mut cache = self.cache.lock().await;
            cache.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            log::debug!(
                "closing backend last used {:?} ago",
                entry.last_used.elapsed()
            );
            if let Err(e) = entry.backend.close().await {
                log::warn!("backend close failed during shutdown: {}", e);
            }
        }
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.lock().await.len()
    }
}
