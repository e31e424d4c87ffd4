//! Bus side of the plugin: client creation, subscriptions and routing of
//! inbound publishes to the agent.

use crate::agent::TotalPowerAgent;
use crate::config::{TopicsConf, TpowerConfig};
use crate::error::Result;
use crate::health::HealthTracker;
use crate::metrics::split_topic;
use crate::models::{AssetEvent, MetricMessage};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Metric(MetricMessage),
    AssetChange(AssetEvent),
}

pub fn create_mqtt_client(config: &TpowerConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&config.mqtt.client_id, &config.mqtt.host, config.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    AsyncClient::new(opts, 64)
}

/// Maps a publish to its message, `Ok(None)` for topics we do not handle
pub fn decode(topics: &TopicsConf, topic: &str, payload: &[u8]) -> Result<Option<Inbound>> {
    if topic == topics.assets {
        let event: AssetEvent = serde_json::from_slice(payload)?;
        return Ok(Some(Inbound::AssetChange(event)));
    }
    let prefix = topics.metrics.trim_end_matches('/');
    match topic.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) if !rest.contains('/') && split_topic(rest).is_some() => {
            let message: MetricMessage = serde_json::from_slice(payload)?;
            Ok(Some(Inbound::Metric(message)))
        }
        _ => Ok(None),
    }
}

/// Hands one publish to the agent
pub fn dispatch(agent: &TotalPowerAgent, topics: &TopicsConf, topic: &str, payload: &[u8]) {
    match decode(topics, topic, payload) {
        Ok(Some(Inbound::Metric(message))) => {
            agent.handle_metric(message);
        }
        Ok(Some(Inbound::AssetChange(event))) => agent.handle_asset_event(&event),
        Ok(None) => debug!("ignoring publish on {}", topic),
        Err(e) => warn!("invalid payload on {}: {}", topic, e),
    }
}

fn subscribe_all(client: &AsyncClient, topics: &TopicsConf) {
    for filter in [topics.metrics_filter(), topics.assets.clone()] {
        match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!("subscribed to {}", filter),
            Err(e) => error!("subscribe to {} failed: {}", filter, e),
        }
    }
}

/// Drives the event loop; subscriptions are renewed on every connection
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    agent: Arc<TotalPowerAgent>,
    topics: TopicsConf,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    subscribe_all(&client, &topics);
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    dispatch(&agent, &topics, &p.topic, &p.payload);
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => health.mark_mqtt_disconnected(),
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {}", e);
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
