use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use symbion_plugin_tpower::config::load_config;
use symbion_plugin_tpower::health::HealthTracker;
use symbion_plugin_tpower::mqtt::{create_mqtt_client, spawn_mqtt_listener};
use symbion_plugin_tpower::ports::file::FileTopologySource;
use symbion_plugin_tpower::ports::mqtt::MqttPublisher;
use symbion_plugin_tpower::{AggregationEngine, TotalPowerAgent};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("symbion_plugin_tpower=info")),
        )
        .init();

    info!("symbion plugin tpower starting...");
    let config = load_config().await;

    let (client, eventloop) = create_mqtt_client(&config);
    let publisher = Arc::new(MqttPublisher::new(client.clone(), config.topics.metrics.clone()));
    let source = FileTopologySource::new(&config.topology.path);
    let engine = AggregationEngine::new(Box::new(source), config.engine.settings());
    let agent = Arc::new(TotalPowerAgent::new(engine, publisher, config.engine.default_ttl_secs));

    if !agent.start() {
        info!("topology not loaded yet, retrying in {}s", config.engine.reconfig_delay_secs);
    }

    let health = HealthTracker::new();
    spawn_mqtt_listener(client.clone(), eventloop, agent.clone(), config.topics.clone(), health.clone());
    health.spawn_health_publisher(
        client,
        config.topics.health.clone(),
        Duration::from_secs(config.health_interval_secs),
        agent.clone(),
    );

    let mut wait = agent.next_wake();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(wait.max(1) as u64)) => {
                wait = agent.poll();
            }
            _ = agent.rescheduled() => {
                wait = agent.next_wake();
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
