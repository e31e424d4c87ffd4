use crate::engine::{EngineSettings, DEFAULT_RECONFIG_DELAY};
use crate::unit::DEFAULT_READVERTISE_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "SYMBION_TPOWER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "tpower.yaml";
pub const DEFAULT_SAMPLE_TTL: i64 = 300;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TpowerConfig {
    pub mqtt: MqttConf,
    pub topics: TopicsConf,
    pub topology: TopologyConf,
    pub engine: EngineConf,
    pub health_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TopicsConf {
    /// prefix of `<quantity>@<element>` topics, both directions
    pub metrics: String,
    pub assets: String,
    pub health: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TopologyConf {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConf {
    pub readvertise_interval_secs: i64,
    pub reconfig_delay_secs: i64,
    /// ttl given to inbound samples that carry none
    pub default_ttl_secs: i64,
}

impl Default for TpowerConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            topics: TopicsConf::default(),
            topology: TopologyConf::default(),
            engine: EngineConf::default(),
            health_interval_secs: 30,
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "symbion-plugin-tpower".into(),
            keep_alive_secs: 30,
        }
    }
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            metrics: "symbion/metrics".into(),
            assets: "symbion/assets/change@v1".into(),
            health: "symbion/tpower/health@v1".into(),
        }
    }
}

impl Default for TopologyConf {
    fn default() -> Self {
        Self { path: PathBuf::from("topology.yaml") }
    }
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            readvertise_interval_secs: DEFAULT_READVERTISE_INTERVAL,
            reconfig_delay_secs: DEFAULT_RECONFIG_DELAY,
            default_ttl_secs: DEFAULT_SAMPLE_TTL,
        }
    }
}

impl EngineConf {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            readvertise_interval: self.readvertise_interval_secs,
            reconfig_delay: self.reconfig_delay_secs,
        }
    }
}

impl TopicsConf {
    /// Subscription filter for inbound device metrics
    pub fn metrics_filter(&self) -> String {
        format!("{}/+", self.metrics.trim_end_matches('/'))
    }
}

impl TpowerConfig {
    /// Replaces durations that are zero or negative by their defaults
    pub fn validated(mut self) -> Self {
        let defaults = EngineConf::default();
        if self.engine.readvertise_interval_secs <= 0 {
            warn!("readvertise_interval_secs must be positive, using {}", defaults.readvertise_interval_secs);
            self.engine.readvertise_interval_secs = defaults.readvertise_interval_secs;
        }
        if self.engine.reconfig_delay_secs <= 0 {
            warn!("reconfig_delay_secs must be positive, using {}", defaults.reconfig_delay_secs);
            self.engine.reconfig_delay_secs = defaults.reconfig_delay_secs;
        }
        if self.engine.default_ttl_secs <= 0 {
            warn!("default_ttl_secs must be positive, using {}", defaults.default_ttl_secs);
            self.engine.default_ttl_secs = defaults.default_ttl_secs;
        }
        if self.health_interval_secs == 0 {
            self.health_interval_secs = TpowerConfig::default().health_interval_secs;
        }
        self
    }
}

/// Reads the file named by `SYMBION_TPOWER_CONFIG` (default `tpower.yaml`)
pub async fn load_config() -> TpowerConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(&path).await
}

/// Missing, empty or invalid files give the defaults
pub async fn load_config_from(path: impl AsRef<Path>) -> TpowerConfig {
    let path = path.as_ref();
    if !path.exists() {
        info!("no {}, using default configuration", path.display());
        return TpowerConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!("cannot read {}: {}", path.display(), e);
            return TpowerConfig::default();
        }
    };
    if txt.trim().is_empty() {
        return TpowerConfig::default();
    }
    match serde_yaml::from_str::<TpowerConfig>(&txt) {
        Ok(config) => config.validated(),
        Err(e) => {
            warn!("invalid configuration {}: {}", path.display(), e);
            TpowerConfig::default()
        }
    }
}
