/*!
Mock MQTT client for broker-less development

Records what a plugin publishes and carries bus traffic into it through an
inbound channel, the way the rumqttc event loop would hand over publishes.
*/

use anyhow::Result;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT client standing in for rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            inbound: Arc::new(Mutex::new(None)),
        }
    }

    /// Receiver of the bus traffic sent with `inject`; replaces any earlier one
    pub fn inbound_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(sender);
        receiver
    }

    /// Records a publication
    pub fn record<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V)
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        debug!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().push(message);
    }

    /// Puts a publish from another bus client on the inbound channel
    pub fn inject<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        let guard = self.inbound.lock();
        let Some(sender) = guard.as_ref() else {
            anyhow::bail!("no inbound receiver for {}", message.topic);
        };
        debug!("[mock] inbound on {}", message.topic);
        sender.send(message).map_err(|e| anyhow::anyhow!("inbound channel closed: {}", e))
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message published on `topic`
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Payloads shaped like the Symbion bus contracts
pub struct SymbionMessageBuilder;

impl SymbionMessageBuilder {
    /// Topic of a metric: `symbion/metrics/<quantity>@<element>`
    pub fn metric_topic(quantity: &str, element: &str) -> String {
        format!("symbion/metrics/{}@{}", quantity, element)
    }

    /// Device metric v1, value as text the way device agents send it
    pub fn metric_v1(name: &str, quantity: &str, value: &str, timestamp: i64, ttl: Option<i64>) -> Value {
        let mut msg = serde_json::json!({
            "name": name,
            "quantity": quantity,
            "unit": "W",
            "value": value,
            "timestamp": timestamp,
        });
        if let Some(ttl) = ttl {
            msg["ttl"] = ttl.into();
        }
        msg
    }

    /// Asset change v1 (`create`, `update`, `delete`, `retire`)
    pub fn asset_change_v1(asset: &str, operation: &str) -> Value {
        serde_json::json!({
            "asset": asset,
            "operation": operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_publications() {
        let client = MockMqttClient::new();
        client.record("test/topic", QoS::AtLeastOnce, false, b"test message".to_vec());
        client.record("other/topic", QoS::AtMostOnce, true, "x");

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, b"test message");
        assert!(messages[1].retain);
        assert_eq!(client.find_messages_by_topic("other/topic").len(), 1);

        client.clear();
        assert!(client.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_injected_message_reaches_receiver() {
        let client = MockMqttClient::new();
        assert!(client.inject("symbion/assets/change@v1", "{}").is_err());

        let mut rx = client.inbound_receiver();
        client.inject("symbion/assets/change@v1", "{}").unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "symbion/assets/change@v1");
        assert_eq!(msg.payload, b"{}");
    }

    #[test]
    fn test_json_message_parsing() {
        let client = MockMqttClient::new();
        let payload = serde_json::to_vec(&serde_json::json!({"test_field": "test_value"})).unwrap();
        client.record("json/topic", QoS::AtLeastOnce, false, payload);

        let parsed: Option<Value> = client.get_last_json_message("json/topic").unwrap();
        assert_eq!(parsed.unwrap()["test_field"], "test_value");
        assert!(client.get_last_json_message::<Value>("none").unwrap().is_none());
    }

    #[test]
    fn test_message_builders() {
        let metric = SymbionMessageBuilder::metric_v1("epdu-1", "realpower.default", "12.5", 100, Some(60));
        assert_eq!(metric["name"], "epdu-1");
        assert_eq!(metric["value"], "12.5");
        assert_eq!(metric["ttl"], 60);

        let metric = SymbionMessageBuilder::metric_v1("epdu-1", "realpower.default", "1", 100, None);
        assert!(metric.get("ttl").is_none());

        let change = SymbionMessageBuilder::asset_change_v1("rack-1", "update");
        assert_eq!(change["operation"], "update");
        assert_eq!(
            SymbionMessageBuilder::metric_topic("realpower.default", "rack-1"),
            "symbion/metrics/realpower.default@rack-1"
        );
    }
}
