//! Error types shared by the aggregation core and its adapters.

/// Errors raised while loading topology, decoding bus messages or computing totals
#[derive(Debug, thiserror::Error)]
pub enum TpowerError {
    #[error("Topology source unavailable: {0}")]
    TopologyUnavailable(String),
    #[error("Invalid metric value '{0}'")]
    InvalidValue(String),
    #[error("Missing measurement {quantity}@{device}")]
    MissingMeasurement { quantity: String, device: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TpowerError {
    pub(crate) fn missing(quantity: &str, device: &str) -> Self {
        TpowerError::MissingMeasurement {
            quantity: quantity.to_string(),
            device: device.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TpowerError>;
