//! Bus payloads: inbound device samples, outbound totals, asset changes.

use crate::error::{Result, TpowerError};
use crate::metrics::MetricSample;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metric on the wire, both directions
///
/// Topic `symbion/metrics/<quantity>@<name>`. The value travels as text the
/// way device agents emit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMessage {
    pub name: String,
    #[serde(alias = "type")]
    pub quantity: String,
    pub unit: String,
    pub value: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl MetricMessage {
    /// Decodes the value text; ttl falls back to `default_ttl` when missing
    /// or not positive. Infinite or overflowing values are rejected.
    pub fn into_sample(self, default_ttl: i64) -> Result<MetricSample> {
        let value = match self.value.trim().parse::<f64>() {
            Ok(v) if !v.is_infinite() => v,
            _ => return Err(TpowerError::InvalidValue(self.value)),
        };
        let ttl = match self.ttl {
            Some(ttl) if ttl > 0 => ttl,
            _ => default_ttl,
        };
        Ok(MetricSample::new(self.name, self.quantity, self.unit, value, self.timestamp, ttl))
    }
}

impl From<&MetricSample> for MetricMessage {
    fn from(sample: &MetricSample) -> Self {
        Self {
            name: sample.element.clone(),
            quantity: sample.quantity.clone(),
            unit: sample.unit.clone(),
            value: sample.value.to_string(),
            timestamp: sample.timestamp,
            ttl: Some(sample.ttl),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetOperation {
    Create,
    Update,
    Delete,
    Retire,
}

impl fmt::Display for AssetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetOperation::Create => "create",
            AssetOperation::Update => "update",
            AssetOperation::Delete => "delete",
            AssetOperation::Retire => "retire",
        };
        f.write_str(s)
    }
}

/// Asset change notification (`symbion/assets/change@v1`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEvent {
    pub asset: String,
    pub operation: AssetOperation,
}
