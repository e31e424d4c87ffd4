//! AggregationEngine - routes device samples to their units and decides what
//! gets published.
//!
//! The engine owns the whole topology as one value: every rack and datacenter
//! unit plus two reverse maps telling which unit a device reading belongs to.
//! A reload builds a fresh `Topology` and replaces the old one in a single
//! assignment, so a half-loaded topology is never visible.
//!
//! The engine does not publish anything itself. Inbound events and poll ticks
//! return `Advertisement`s; the caller publishes them and reports each outcome
//! through `complete()`.

use crate::error::Result;
use crate::metrics::MetricSample;
use crate::models::AssetEvent;
use crate::ports::TopologySource;
use crate::topology::{resolve_all, ContainerKind};
use crate::unit::{
    Strategy, UnitAggregator, DEFAULT_READVERTISE_INTERVAL, REALPOWER_DEFAULT, REALPOWER_OUTPUT_L1,
    REALPOWER_OUTPUT_L2, REALPOWER_OUTPUT_L3,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, trace, warn};

pub const RACK_QUANTITIES: [&str; 1] = [REALPOWER_DEFAULT];

pub const DC_QUANTITIES: [&str; 7] = [
    REALPOWER_DEFAULT,
    "realpower.input.L1",
    "realpower.input.L2",
    "realpower.input.L3",
    REALPOWER_OUTPUT_L1,
    REALPOWER_OUTPUT_L2,
    REALPOWER_OUTPUT_L3,
];

pub const DEFAULT_RECONFIG_DELAY: i64 = 60;

/// Quantities published for a container kind
pub fn published_quantities(kind: ContainerKind) -> &'static [&'static str] {
    match kind {
        ContainerKind::Rack => &RACK_QUANTITIES,
        ContainerKind::Datacenter => &DC_QUANTITIES,
    }
}

/// Published quantities of `kind` that read `quantity` from member devices
pub fn dependents(kind: ContainerKind, quantity: &str) -> Vec<&'static str> {
    published_quantities(kind)
        .iter()
        .copied()
        .filter(|published| Strategy::inputs(published).contains(&quantity))
        .collect()
}

pub fn accepts(kind: ContainerKind, quantity: &str) -> bool {
    !dependents(kind, quantity).is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Seconds between two publications of an unchanged total
    pub readvertise_interval: i64,
    /// Seconds between an asset change (or a failed load) and the reload
    pub reconfig_delay: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            readvertise_interval: DEFAULT_READVERTISE_INTERVAL,
            reconfig_delay: DEFAULT_RECONFIG_DELAY,
        }
    }
}

/// Everything a reload replaces
#[derive(Debug, Default)]
pub struct Topology {
    racks: BTreeMap<String, UnitAggregator>,
    datacenters: BTreeMap<String, UnitAggregator>,
    device_to_rack: HashMap<String, String>,
    device_to_dc: HashMap<String, String>,
}

impl Topology {
    /// Loads and resolves every rack and datacenter
    pub fn build(source: &dyn TopologySource, readvertise_interval: i64) -> Result<Self> {
        let mut topology = Topology::default();
        for kind in ContainerKind::ALL {
            for resolved in resolve_all(source, kind)? {
                let name = resolved.container.name;
                if resolved.devices.is_empty() {
                    info!("{} '{}' has no power device to sum, skipped", kind, name);
                    continue;
                }
                let owners = topology.owners_mut(kind);
                for device in &resolved.devices {
                    if let Some(previous) = owners.insert(device.clone(), name.clone()) {
                        warn!(
                            "device '{}' is summed in {} '{}' and '{}', keeping the latter",
                            device, kind, previous, name
                        );
                    }
                }
                let unit = UnitAggregator::with_devices(name.clone(), resolved.devices, readvertise_interval);
                topology.units_mut(kind).insert(name, unit);
            }
        }
        Ok(topology)
    }

    pub fn units(&self, kind: ContainerKind) -> &BTreeMap<String, UnitAggregator> {
        match kind {
            ContainerKind::Rack => &self.racks,
            ContainerKind::Datacenter => &self.datacenters,
        }
    }

    fn units_mut(&mut self, kind: ContainerKind) -> &mut BTreeMap<String, UnitAggregator> {
        match kind {
            ContainerKind::Rack => &mut self.racks,
            ContainerKind::Datacenter => &mut self.datacenters,
        }
    }

    /// Unit summing `device` for the given kind
    pub fn owner(&self, kind: ContainerKind, device: &str) -> Option<&str> {
        let owners = match kind {
            ContainerKind::Rack => &self.device_to_rack,
            ContainerKind::Datacenter => &self.device_to_dc,
        };
        owners.get(device).map(String::as_str)
    }

    fn owners_mut(&mut self, kind: ContainerKind) -> &mut HashMap<String, String> {
        match kind {
            ContainerKind::Rack => &mut self.device_to_rack,
            ContainerKind::Datacenter => &mut self.device_to_dc,
        }
    }

    /// Distinct devices summed anywhere
    pub fn device_count(&self) -> usize {
        self.device_to_rack
            .keys()
            .chain(self.device_to_dc.keys())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// A computed total ready to go on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub kind: ContainerKind,
    pub quantity: String,
    pub sample: MetricSample,
}

impl Advertisement {
    pub fn unit(&self) -> &str {
        &self.sample.element
    }
}

/// Counters and sizes reported in the health message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub configured: bool,
    pub racks: usize,
    pub datacenters: usize,
    pub devices: usize,
    pub reconfig_pending: Option<i64>,
    pub in_flight: usize,
    pub published: u64,
    pub publish_failures: u64,
    pub reloads: u64,
    pub reload_failures: u64,
}

pub struct AggregationEngine {
    source: Box<dyn TopologySource>,
    settings: EngineSettings,
    topology: Topology,
    configured: bool,
    reconfig_pending: Option<i64>,
    /// outbound topics handed to the caller and not completed yet
    in_flight: HashSet<String>,
    published: u64,
    publish_failures: u64,
    reloads: u64,
    reload_failures: u64,
}

impl AggregationEngine {
    pub fn new(source: Box<dyn TopologySource>, settings: EngineSettings) -> Self {
        Self {
            source,
            settings,
            topology: Topology::default(),
            configured: false,
            reconfig_pending: None,
            in_flight: HashSet::new(),
            published: 0,
            publish_failures: 0,
            reloads: 0,
            reload_failures: 0,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn reconfig_pending(&self) -> Option<i64> {
        self.reconfig_pending
    }

    pub fn unit(&self, kind: ContainerKind, name: &str) -> Option<&UnitAggregator> {
        self.topology.units(kind).get(name)
    }

    /// Reloads the topology. On failure the current topology stays live and
    /// a retry is scheduled.
    pub fn configure(&mut self, now: i64) -> bool {
        debug!("configuration begin");
        match Topology::build(self.source.as_ref(), self.settings.readvertise_interval) {
            Ok(topology) => {
                self.topology = topology;
                self.configured = true;
                self.reconfig_pending = None;
                self.reloads += 1;
                info!(
                    "configured {} racks, {} datacenters, {} devices",
                    self.topology.racks.len(),
                    self.topology.datacenters.len(),
                    self.topology.device_count()
                );
                true
            }
            Err(e) => {
                let deadline = now + self.settings.reconfig_delay;
                self.reconfig_pending = Some(deadline);
                self.reload_failures += 1;
                warn!("topology load failed ({}), retry at {}", e, deadline);
                false
            }
        }
    }

    /// Any asset change schedules one reload, further changes before the
    /// deadline are absorbed by it
    pub fn on_asset_event(&mut self, event: &AssetEvent, now: i64) {
        match self.reconfig_pending {
            Some(deadline) => {
                debug!("asset '{}' {}, reload already scheduled at {}", event.asset, event.operation, deadline);
            }
            None => {
                let deadline = now + self.settings.reconfig_delay;
                info!("asset '{}' {}, reload scheduled at {}", event.asset, event.operation, deadline);
                self.reconfig_pending = Some(deadline);
            }
        }
    }

    /// Stores a device reading in the rack and the datacenter summing that
    /// device, then recomputes the totals reading it
    pub fn on_metric(&mut self, sample: MetricSample, now: i64) -> Vec<Advertisement> {
        let mut advertisements = Vec::new();
        let mut routed = false;

        for kind in ContainerKind::ALL {
            let quantities = dependents(kind, &sample.quantity);
            if quantities.is_empty() {
                continue;
            }
            let Some(owner) = self.topology.owner(kind, &sample.element).map(str::to_owned) else {
                continue;
            };
            let Some(unit) = self.topology.units_mut(kind).get_mut(&owner) else {
                continue;
            };

            routed = true;
            unit.set_measurement(sample.clone());
            unit.calculate_all(&quantities, now);
            for quantity in quantities {
                if let Some(advertisement) = candidate(unit, kind, quantity, now, &mut self.in_flight) {
                    advertisements.push(advertisement);
                }
            }
        }

        if !routed {
            trace!("{} not summed anywhere", sample.topic());
        }
        advertisements
    }

    /// Periodic pass: runs a due reload, then recomputes every total and
    /// returns those due for publication
    pub fn on_poll(&mut self, now: i64) -> Vec<Advertisement> {
        if let Some(deadline) = self.reconfig_pending {
            if now >= deadline {
                info!("reconfiguration deadline reached");
                self.configure(now);
            }
        }

        let mut advertisements = Vec::new();
        for kind in ContainerKind::ALL {
            let quantities = published_quantities(kind);
            for unit in self.topology.units_mut(kind).values_mut() {
                unit.calculate_all(quantities, now);
                for &quantity in quantities {
                    match candidate(unit, kind, quantity, now, &mut self.in_flight) {
                        Some(advertisement) => advertisements.push(advertisement),
                        None => report_unknown(unit, quantity, now),
                    }
                }
            }
        }
        advertisements
    }

    /// Publication outcome of an advertisement returned earlier
    pub fn complete(&mut self, advertisement: &Advertisement, published: bool, now: i64) {
        self.in_flight.remove(&advertisement.sample.topic());
        if !published {
            self.publish_failures += 1;
            warn!("failed to publish {}", advertisement.sample.topic());
            return;
        }
        self.published += 1;
        match self.topology.units_mut(advertisement.kind).get_mut(advertisement.unit()) {
            Some(unit) => unit.advertised_value(&advertisement.quantity, advertisement.sample.value, now),
            None => debug!("{} is gone since the reload", advertisement.unit()),
        }
    }

    /// Seconds until the next poll should run
    pub fn next_wake(&self, now: i64) -> i64 {
        let interval = self.settings.readvertise_interval;
        let mut wake = interval;
        for kind in ContainerKind::ALL {
            for unit in self.topology.units(kind).values() {
                for quantity in published_quantities(kind) {
                    let t = unit.time_to_next_advertisement(quantity, now);
                    if t > 0 && t < wake {
                        wake = t;
                    }
                }
            }
        }
        if let Some(deadline) = self.reconfig_pending {
            wake = wake.min((deadline - now + 1).max(1));
        }
        wake.max(1)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            configured: self.configured,
            racks: self.topology.racks.len(),
            datacenters: self.topology.datacenters.len(),
            devices: self.topology.device_count(),
            reconfig_pending: self.reconfig_pending,
            in_flight: self.in_flight.len(),
            published: self.published,
            publish_failures: self.publish_failures,
            reloads: self.reloads,
            reload_failures: self.reload_failures,
        }
    }
}

fn candidate(
    unit: &UnitAggregator,
    kind: ContainerKind,
    quantity: &str,
    now: i64,
    in_flight: &mut HashSet<String>,
) -> Option<Advertisement> {
    if !unit.advertise(quantity, now) {
        return None;
    }
    let sample = unit.outgoing(quantity, now)?;
    if !in_flight.insert(sample.topic()) {
        trace!("{} already being published", sample.topic());
        return None;
    }
    Some(Advertisement {
        kind,
        quantity: quantity.to_string(),
        sample,
    })
}

fn report_unknown(unit: &UnitAggregator, quantity: &str, now: i64) {
    let unknown = unit.devices_in_unknown_state(quantity, now);
    if !unknown.is_empty() {
        info!(
            "{}@{} cannot be computed, devices in unknown state: {}",
            quantity,
            unit.name(),
            unknown.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TpowerError;
    use crate::models::AssetOperation;
    use crate::topology::{Container, DeviceInfo, DeviceKind, PowerLink};
    use crate::unit::REALPOWER_OUTPUT;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// rack-1: epdu-1, epdu-2. dc-1: ups-1 feeding both epdus.
    #[derive(Default)]
    struct MemorySource {
        listings: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
    }

    impl TopologySource for MemorySource {
        fn containers(&self, kind: ContainerKind) -> Result<Vec<Container>> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(TpowerError::TopologyUnavailable("asset database down".into()));
            }
            if kind == ContainerKind::Rack {
                self.listings.fetch_add(1, Ordering::SeqCst);
            }
            let name = match kind {
                ContainerKind::Rack => "rack-1",
                ContainerKind::Datacenter => "dc-1",
            };
            Ok(vec![
                Container { id: 1, name: name.into(), kind },
                Container { id: 2, name: format!("{}-empty", name), kind },
            ])
        }

        fn devices(&self, container: &Container) -> Result<Vec<DeviceInfo>> {
            Ok(match container.name.as_str() {
                "rack-1" => vec![
                    DeviceInfo::new("epdu-1", DeviceKind::Epdu),
                    DeviceInfo::new("epdu-2", DeviceKind::Epdu),
                ],
                "dc-1" => vec![
                    DeviceInfo::new("ups-1", DeviceKind::Ups),
                    DeviceInfo::new("epdu-1", DeviceKind::Epdu),
                    DeviceInfo::new("epdu-2", DeviceKind::Epdu),
                ],
                _ => Vec::new(),
            })
        }

        fn links(&self, container: &Container) -> Result<Vec<PowerLink>> {
            Ok(match container.name.as_str() {
                "rack-1" => vec![PowerLink::new("ups-1", "epdu-1"), PowerLink::new("ups-1", "epdu-2")],
                "dc-1" => vec![PowerLink::new("ups-1", "epdu-1"), PowerLink::new("ups-1", "epdu-2")],
                _ => Vec::new(),
            })
        }
    }

    fn engine() -> (AggregationEngine, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let source = MemorySource::default();
        let listings = source.listings.clone();
        let broken = source.broken.clone();
        (
            AggregationEngine::new(Box::new(source), EngineSettings::default()),
            listings,
            broken,
        )
    }

    fn reading(device: &str, quantity: &str, value: f64, timestamp: i64) -> MetricSample {
        MetricSample::new(device, quantity, "W", value, timestamp, 300)
    }

    fn asset_event(asset: &str) -> AssetEvent {
        AssetEvent {
            asset: asset.into(),
            operation: AssetOperation::Update,
        }
    }

    #[test]
    fn test_quantity_routing_table() {
        assert!(accepts(ContainerKind::Rack, "realpower.default"));
        assert!(accepts(ContainerKind::Rack, "realpower.output.L2"));
        assert!(!accepts(ContainerKind::Rack, "realpower.input.L1"));
        assert!(accepts(ContainerKind::Datacenter, "realpower.input.L1"));
        assert!(!accepts(ContainerKind::Datacenter, "temperature"));
        assert_eq!(
            dependents(ContainerKind::Datacenter, "realpower.output.L2"),
            vec!["realpower.default", "realpower.output.L1", "realpower.output.L2", "realpower.output.L3"]
        );
    }

    #[test]
    fn test_configure_builds_units_and_reverse_maps() {
        let (mut engine, _, _) = engine();
        assert!(engine.configure(0));

        let stats = engine.stats();
        assert!(stats.configured);
        assert_eq!(stats.racks, 1);
        assert_eq!(stats.datacenters, 1);
        assert_eq!(stats.devices, 3);

        let topology = engine.topology();
        assert_eq!(topology.owner(ContainerKind::Rack, "epdu-1"), Some("rack-1"));
        assert_eq!(topology.owner(ContainerKind::Datacenter, "ups-1"), Some("dc-1"));
        assert_eq!(topology.owner(ContainerKind::Datacenter, "epdu-1"), None);
        assert!(engine.unit(ContainerKind::Rack, "rack-1-empty").is_none());
    }

    #[test]
    fn test_metric_routed_and_advertised_once() {
        let (mut engine, _, _) = engine();
        engine.configure(0);

        assert!(engine.on_metric(reading("epdu-1", REALPOWER_DEFAULT, 10.0, 100), 100).is_empty());
        let ads = engine.on_metric(reading("epdu-2", REALPOWER_DEFAULT, 15.0, 100), 100);
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].sample.topic(), "realpower.default@rack-1");
        assert_eq!(ads[0].sample.value, 25.0);
        assert_eq!(ads[0].sample.ttl, 1800);

        engine.complete(&ads[0], true, 100);
        assert!(engine.on_poll(150).is_empty());
        assert_eq!(engine.next_wake(150), 250);
        assert_eq!(engine.stats().published, 1);
    }

    #[test]
    fn test_one_device_reading_feeds_its_units_only() {
        let (mut engine, _, _) = engine();
        engine.configure(0);

        let ads = engine.on_metric(reading("ups-1", "realpower.input.L1", 40.0, 100), 100);
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].kind, ContainerKind::Datacenter);
        assert_eq!(ads[0].sample.topic(), "realpower.input.L1@dc-1");

        // not a rack quantity
        let rack = engine.unit(ContainerKind::Rack, "rack-1").unwrap();
        assert!(!rack.is_known("realpower.input.L1"));

        // unknown device
        assert!(engine.on_metric(reading("server-9", REALPOWER_DEFAULT, 1.0, 100), 100).is_empty());
    }

    /// A datacenter without UPS: its single ePDU is also the rack's
    struct SharedEpdu;

    impl TopologySource for SharedEpdu {
        fn containers(&self, kind: ContainerKind) -> Result<Vec<Container>> {
            let name = match kind {
                ContainerKind::Rack => "rack-1",
                ContainerKind::Datacenter => "dc-1",
            };
            Ok(vec![Container { id: 1, name: name.into(), kind }])
        }

        fn devices(&self, _container: &Container) -> Result<Vec<DeviceInfo>> {
            Ok(vec![DeviceInfo::new("epdu-1", DeviceKind::Epdu)])
        }

        fn links(&self, _container: &Container) -> Result<Vec<PowerLink>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_device_feeding_rack_and_datacenter() {
        let mut engine = AggregationEngine::new(Box::new(SharedEpdu), EngineSettings::default());
        assert!(engine.configure(0));
        assert_eq!(engine.topology().owner(ContainerKind::Rack, "epdu-1"), Some("rack-1"));
        assert_eq!(engine.topology().owner(ContainerKind::Datacenter, "epdu-1"), Some("dc-1"));

        let ads = engine.on_metric(reading("epdu-1", REALPOWER_DEFAULT, 42.0, 100), 100);
        assert_eq!(ads.len(), 2);
        let mut topics: Vec<String> = ads.iter().map(|ad| ad.sample.topic()).collect();
        topics.sort();
        assert_eq!(topics, vec!["realpower.default@dc-1", "realpower.default@rack-1"]);
        assert!(ads.iter().all(|ad| ad.sample.value == 42.0));

        for kind in ContainerKind::ALL {
            let name = if kind == ContainerKind::Rack { "rack-1" } else { "dc-1" };
            assert_eq!(engine.unit(kind, name).map(|u| u.value(REALPOWER_DEFAULT)), Some(42.0));
        }
    }

    #[test]
    fn test_rack_default_from_phases() {
        let (mut engine, _, _) = engine();
        engine.configure(0);
        engine.on_metric(reading("epdu-1", REALPOWER_DEFAULT, 10.0, 100), 100);
        let mut ads = Vec::new();
        for phase in REALPOWER_OUTPUT {
            ads.extend(engine.on_metric(reading("epdu-2", phase, 5.0, 100), 100));
        }
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].sample.value, 25.0);
    }

    #[test]
    fn test_in_flight_total_is_not_proposed_twice() {
        let (mut engine, _, _) = engine();
        engine.configure(0);

        let first = engine.on_metric(reading("ups-1", "realpower.input.L1", 40.0, 100), 100);
        assert_eq!(first.len(), 1);
        assert!(engine.on_metric(reading("ups-1", "realpower.input.L1", 41.0, 100), 100).is_empty());
        assert_eq!(engine.stats().in_flight, 1);

        // the stale 40 went out, 41 is still owed
        engine.complete(&first[0], true, 100);
        let ads = engine.on_poll(101);
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].sample.value, 41.0);
    }

    #[test]
    fn test_publish_failure_keeps_total_due() {
        let (mut engine, _, _) = engine();
        engine.configure(0);

        let ads = engine.on_metric(reading("ups-1", "realpower.input.L2", 40.0, 100), 100);
        engine.complete(&ads[0], false, 100);
        assert_eq!(engine.stats().publish_failures, 1);

        let retry = engine.on_poll(101);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].sample.topic(), "realpower.input.L2@dc-1");
    }

    #[test]
    fn test_asset_events_are_debounced() {
        let (mut engine, listings, _) = engine();
        engine.configure(0);
        assert_eq!(listings.load(Ordering::SeqCst), 1);

        engine.on_asset_event(&asset_event("epdu-3"), 100);
        engine.on_asset_event(&asset_event("epdu-4"), 110);
        assert_eq!(engine.reconfig_pending(), Some(160));
        assert_eq!(engine.next_wake(110), 51);

        engine.on_poll(150);
        assert_eq!(listings.load(Ordering::SeqCst), 1);
        engine.on_poll(160);
        assert_eq!(listings.load(Ordering::SeqCst), 2);
        engine.on_poll(171);
        assert_eq!(listings.load(Ordering::SeqCst), 2);
        assert_eq!(engine.reconfig_pending(), None);
    }

    #[test]
    fn test_failed_load_keeps_topology_and_retries() {
        let (mut engine, listings, broken) = engine();
        engine.configure(0);
        engine.on_metric(reading("ups-1", "realpower.input.L1", 40.0, 100), 100);

        broken.store(true, Ordering::SeqCst);
        engine.on_asset_event(&asset_event("ups-1"), 100);
        engine.on_poll(160);
        assert_eq!(engine.reconfig_pending(), Some(220));
        assert_eq!(engine.stats().reload_failures, 1);
        let dc = engine.unit(ContainerKind::Datacenter, "dc-1").unwrap();
        assert_eq!(dc.value("realpower.input.L1"), 40.0);

        broken.store(false, Ordering::SeqCst);
        engine.on_poll(220);
        assert_eq!(engine.reconfig_pending(), None);
        assert_eq!(listings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unconfigured_engine_sleeps_one_interval() {
        let (mut engine, _, broken) = engine();
        assert_eq!(engine.next_wake(0), DEFAULT_READVERTISE_INTERVAL);
        assert!(engine.on_metric(reading("epdu-1", REALPOWER_DEFAULT, 10.0, 0), 0).is_empty());

        broken.store(true, Ordering::SeqCst);
        assert!(!engine.configure(0));
        assert!(!engine.is_configured());
        assert_eq!(engine.next_wake(0), 61);
    }
}
