//! twinlink agent binary
//!
//! Runs the demo temperature controller against an MQTT broker until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use twinlink_agent::devices::Controller;
use twinlink_agent::transport::mqtt::MqttConnector;
use twinlink_agent::{Agent, AgentConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("twinlink_agent=info")),
        )
        .init();

    let config = AgentConfig::load().await.context("Failed to load configuration")?;

    let mut agent = Agent::new(Arc::new(Controller::discover()), &config.agent);
    agent.initialize(&config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                on_signal.cancel();
            }
            Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
        }
    });

    let connector = MqttConnector::new(config.clone());
    agent.run(&connector, cancel).await.context("Agent execution failed")?;

    Ok(())
}
