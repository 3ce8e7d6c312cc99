pub mod audit;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod google_api;
pub mod intelligence;
pub mod latency;
mod migrations;
pub mod processor;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod types;
pub mod util;
pub mod webhook;

use std::sync::Arc;

use error::PipelineError;
use scheduler::Scheduler;
use state::AppState;

/// Start the optional drain scheduler, then serve HTTP until Ctrl-C.
pub async fn run(state: Arc<AppState>) -> Result<(), PipelineError> {
    if let Some(scheduler) = Scheduler::from_config(state.clone())? {
        tokio::spawn(async move {
            scheduler.run().await;
        });
    }

    let bind = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| PipelineError::Configuration(format!("Failed to bind {}: {}", bind, e)))?;
    log::info!("finmail listening on {}", bind);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutting down");
        })
        .await
        .map_err(|e| PipelineError::Configuration(format!("Server error: {}", e)))
}
