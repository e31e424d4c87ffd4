/*!
Test harness for Symbion plugins

Bundles a mock MQTT client and a manual clock, plus assertions on what the
plugin published.
*/

use crate::clock::ManualClock;
use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub clock: ManualClock,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    /// Harness whose clock starts at `start` (unix seconds)
    pub fn new(start: i64) -> Self {
        init_test_logging();
        Self {
            mqtt_client: MockMqttClient::new(),
            clock: ManualClock::new(start),
            expectations: Vec::new(),
        }
    }

    /// Expect exactly `count` messages on `topic` at verification time
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        info!("{} expectations verified", self.expectations.len());
        Ok(())
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.mqtt_client.find_messages_by_topic(topic).len()
    }

    /// Asserts a field (dotted path) of the last message on `topic`
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? else {
            anyhow::bail!("No message on {}", topic);
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch on {}: expected {:?}, got {:?}",
                field_path,
                topic,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

/// Installs a test-writer subscriber once, honouring `RUST_LOG`
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}
