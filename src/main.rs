use std::net::SocketAddr;

use incidentllm::config::PlatformConfig;
use incidentllm::server::{router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = PlatformConfig::from_env();
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let state = AppState::from_config(config);
    let registry = state.registry.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("incidentllm listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down; closing cached backends");
        })
        .await?;

    // Close every cached backend before the process exits.
    registry.shutdown().await;
    Ok(())
}
