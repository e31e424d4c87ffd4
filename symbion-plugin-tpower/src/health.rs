use crate::agent::TotalPowerAgent;
use crate::engine::EngineStats;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct TpowerHealth {
    pub instance_id: String,
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    #[serde(flatten)]
    pub engine: EngineStats,
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct HealthTracker {
    instance_id: String,
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, agent: &TotalPowerAgent) -> TpowerHealth {
        TpowerHealth {
            instance_id: self.instance_id.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            engine: agent.stats(),
            timestamp: agent.now(),
        }
    }

    /// Publishes the health report on `topic` every `period`
    pub fn spawn_health_publisher(
        &self,
        client: AsyncClient,
        topic: String,
        period: Duration,
        agent: Arc<TotalPowerAgent>,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&agent);
                let payload = match serde_json::to_string(&health) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("health report serialization failed: {}", e);
                        continue;
                    }
                };
                match client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
                    Ok(()) => debug!(
                        "published health (uptime: {}s, racks: {}, datacenters: {})",
                        health.uptime_seconds, health.engine.racks, health.engine.datacenters
                    ),
                    Err(e) => error!("failed to publish health: {}", e),
                }
            }
        })
    }
}
