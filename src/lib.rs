pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
mod migrations;
pub mod orchestrator;
pub mod recording;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;

use tokio::sync::watch;

use collaborators::http::{HttpMeetingBot, HttpRecorder};
use collaborators::AllowAll;
use error::OrchestratorError;
use orchestrator::Orchestrator;
use store::sqlite::SqliteEventStore;

/// Process entry point: load config, open the store, run until ctrl-c.
pub fn run() -> Result<(), OrchestratorError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::load_config()?;
    let db_path = config.database_path()?;
    let store = Arc::new(SqliteEventStore::open(&db_path)?);

    let bot_url = config.bot_service_url.as_deref().ok_or_else(|| {
        OrchestratorError::ConfigurationError("botServiceUrl is not set".to_string())
    })?;
    let recorder_url = config.recorder_service_url.as_deref().ok_or_else(|| {
        OrchestratorError::ConfigurationError("recorderServiceUrl is not set".to_string())
    })?;
    let joiner = Arc::new(HttpMeetingBot::new(bot_url)?);
    let recorder = Arc::new(HttpRecorder::new(recorder_url)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            OrchestratorError::ConfigurationError(format!("Failed to start runtime: {}", e))
        })?;

    runtime.block_on(async move {
        let orchestrator = Orchestrator::new(config, store, joiner, recorder, Arc::new(AllowAll));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Received ctrl-c, shutting down");
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => {
                    log::error!("Failed to listen for ctrl-c: {}", e);
                    // Keep the sender alive so the orchestrator keeps running
                    std::future::pending::<()>().await;
                }
            }
        });

        orchestrator.run(shutdown_rx).await
    })
}
