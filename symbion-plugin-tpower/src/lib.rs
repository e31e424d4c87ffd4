/**
 * SYMBION PLUGIN TPOWER - Rack and datacenter total power
 *
 * ROLE:
 * Listens to per-device power telemetry on the bus and publishes, for every
 * rack and datacenter, the total power flowing into it.
 *
 * OPERATION:
 * - Topology (containers, devices, power links) comes from a TopologySource
 * - Each container sums a small set of representative devices found by
 *   walking its power chain, so no watt is counted twice
 * - Totals are published on change and re-published every interval
 * - Asset changes trigger a debounced topology reload
 *
 * MQTT:
 * Listens: symbion/metrics/+, symbion/assets/change@v1
 * Publishes: symbion/metrics/<quantity>@<rack|dc>, symbion/tpower/health@v1
 */

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod ports;
pub mod topology;
pub mod unit;

pub use agent::TotalPowerAgent;
pub use engine::{Advertisement, AggregationEngine, EngineSettings, EngineStats};
pub use error::{Result, TpowerError};
pub use metrics::{MetricCache, MetricSample};
pub use ports::{Publisher, TopologySource};
pub use unit::UnitAggregator;
