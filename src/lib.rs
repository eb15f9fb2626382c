// src/lib.rs

// Import the top-level `incidentllm` module.
pub mod incidentllm;

// Re-exporting key items for easier external access.
pub use incidentllm::backend;
pub use incidentllm::backends;
pub use incidentllm::bridge;
pub use incidentllm::config;
pub use incidentllm::context;
pub use incidentllm::credentials;
pub use incidentllm::error;
pub use incidentllm::ingest;
pub use incidentllm::provisioner;
pub use incidentllm::registry;
pub use incidentllm::runtime;
pub use incidentllm::scenario;
pub use incidentllm::search;
pub use incidentllm::server;
pub use incidentllm::sse;
pub use incidentllm::store;

pub use incidentllm::sse::EventBus;

/// Initialise env_logger once, safe to call from every test.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
