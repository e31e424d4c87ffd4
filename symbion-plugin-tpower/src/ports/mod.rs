//! PORTS - Narrow interfaces between the aggregation core and the outside
//!
//! ROLE:
//! The engine never talks to an asset database or to a broker by itself. It
//! only sees two capabilities, both injected at startup:
//!
//! - `TopologySource` = list containers of a kind, their devices and the
//!   power links touching them
//! - `Publisher` = send one computed metric, say whether it went out
//!
//! IMPLEMENTATIONS:
//! - `file::FileTopologySource` reads a YAML topology description
//! - `mqtt::MqttPublisher` publishes on the Symbion MQTT bus
//!
//! Tests plug in their own in-memory versions of both.

pub mod file;
pub mod mqtt;

use crate::error::Result;
use crate::metrics::MetricSample;
use crate::topology::{Container, ContainerKind, DeviceInfo, PowerLink};

/// Read access to the asset topology
///
/// Every call may fail independently; the caller decides whether a failure
/// affects one container or the whole reload.
pub trait TopologySource: Send {
    /// All containers of the requested kind
    fn containers(&self, kind: ContainerKind) -> Result<Vec<Container>>;

    /// Devices placed in the container
    fn devices(&self, container: &Container) -> Result<Vec<DeviceInfo>>;

    /// Power links with at least one end inside the container
    fn links(&self, container: &Container) -> Result<Vec<PowerLink>>;
}

/// Outbound side of the plugin
pub trait Publisher: Send + Sync {
    /// Sends a computed metric, true when the transport accepted it
    fn publish(&self, sample: &MetricSample) -> bool;
}
