//! Cirrus formation service binary.
//!
//! Runs the provisioning orchestrator until interrupted.

use tracing::info;
use tracing_subscriber::EnvFilter;

use cirrus_formation::{FormationConfig, FormationService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("cirrus_formation=info".parse()?),
        )
        .init();

    info!("cirrus formation service starting");

    let config = FormationConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        FormationConfig::default()
    });

    info!(
        database = %config.database.url,
        queue = %config.scheduler.queue,
        poll_interval_secs = config.scheduler.poll_interval_secs,
        max_poll_attempts = config.scheduler.max_poll_attempts,
        failure_policy = ?config.orchestrator.failure_policy,
        "configuration loaded"
    );

    let service = FormationService::from_config(config).await;
    service.run().await?;

    Ok(())
}
