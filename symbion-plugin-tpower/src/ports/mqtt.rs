//! Publisher over the Symbion MQTT bus.

use super::Publisher;
use crate::metrics::MetricSample;
use crate::models::MetricMessage;
use rumqttc::{AsyncClient, QoS};
use tracing::{error, trace};

/// Publishes computed totals on `<prefix>/<quantity>@<unit>`
///
/// Uses the non-blocking `try_publish`: a full request queue is reported as
/// a failed publish instead of stalling the caller.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    prefix: String,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn topic_for(&self, sample: &MetricSample) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), sample.topic())
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, sample: &MetricSample) -> bool {
        let topic = self.topic_for(sample);
        let payload = match serde_json::to_vec(&MetricMessage::from(sample)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("cannot serialize {}: {}", topic, e);
                return false;
            }
        };
        match self.client.try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload) {
            Ok(()) => {
                trace!("metric sent: topic = {}, time = {}, value = {}", topic, sample.timestamp, sample.value);
                true
            }
            Err(e) => {
                error!("failed to publish {}: {:?}", topic, e);
                false
            }
        }
    }
}
