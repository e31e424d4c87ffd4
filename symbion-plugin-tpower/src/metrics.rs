//! Raw and computed metric samples, and the last-value cache that holds them.
//!
//! A topic is always `quantity@element`. Each cache keeps exactly one sample
//! per topic; eviction is explicit and driven by the owner before it
//! recomputes anything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One measurement of one quantity on one element (device, rack or DC)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub element: String,
    pub quantity: String,
    pub unit: String,
    pub value: f64,
    /// Unix seconds
    pub timestamp: i64,
    /// Seconds, always > 0
    pub ttl: i64,
}

impl MetricSample {
    pub fn new(
        element: impl Into<String>,
        quantity: impl Into<String>,
        unit: impl Into<String>,
        value: f64,
        timestamp: i64,
        ttl: i64,
    ) -> Self {
        Self {
            element: element.into(),
            quantity: quantity.into(),
            unit: unit.into(),
            value,
            timestamp,
            ttl,
        }
    }

    pub fn topic(&self) -> String {
        topic(&self.quantity, &self.element)
    }

    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.age(now) > self.ttl
    }
}

/// Builds the `quantity@element` key
pub fn topic(quantity: &str, element: &str) -> String {
    format!("{}@{}", quantity, element)
}

/// Splits a `quantity@element` key. The element may itself contain `@`,
/// the quantity never does.
pub fn split_topic(topic: &str) -> Option<(&str, &str)> {
    let (quantity, element) = topic.split_once('@')?;
    if quantity.is_empty() || element.is_empty() {
        return None;
    }
    Some((quantity, element))
}

/// Last-write-wins store, one live sample per topic
#[derive(Debug, Default, Clone)]
pub struct MetricCache {
    samples: HashMap<String, MetricSample>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was stored under the sample's topic
    pub fn upsert(&mut self, sample: MetricSample) {
        self.samples.insert(sample.topic(), sample);
    }

    pub fn get(&self, topic: &str) -> Option<&MetricSample> {
        self.samples.get(topic)
    }

    /// Value stored for a topic, NaN when nothing is stored
    pub fn value(&self, topic: &str) -> f64 {
        self.samples.get(topic).map(|s| s.value).unwrap_or(f64::NAN)
    }

    /// Drops every sample older than its own ttl, returns how many went away
    pub fn evict_expired(&mut self, now: i64) -> usize {
        let before = self.samples.len();
        self.samples.retain(|_, sample| !sample.is_expired(now));
        before - self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.samples.keys().cloned().collect();
        topics.sort();
        topics
    }
}
