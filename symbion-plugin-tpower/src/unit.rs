//! One total-power unit: a rack or a datacenter and the devices summed for it.
//!
//! Each member device keeps its own last-value cache. Computed totals live in
//! a separate cache keyed `quantity@unit`, next to a small per-quantity state
//! deciding when the total must be (re)published.

use crate::error::{Result, TpowerError};
use crate::metrics::{topic, MetricCache, MetricSample};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

pub const REALPOWER_DEFAULT: &str = "realpower.default";
pub const REALPOWER_OUTPUT_L1: &str = "realpower.output.L1";
pub const REALPOWER_OUTPUT_L2: &str = "realpower.output.L2";
pub const REALPOWER_OUTPUT_L3: &str = "realpower.output.L3";
pub const REALPOWER_OUTPUT: [&str; 3] = [REALPOWER_OUTPUT_L1, REALPOWER_OUTPUT_L2, REALPOWER_OUTPUT_L3];

/// Published totals are always watts
pub const UNIT_WATT: &str = "W";

/// Values closer than this are the same value
pub const EPSILON: f64 = 0.00001;

pub const DEFAULT_READVERTISE_INTERVAL: i64 = 300;

/// How a total is derived from member readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Plain sum, every member must report
    GenericSum,
    /// Sum of `realpower.default`, per-device fallback to its three output phases
    DefaultRealPower,
    /// One output phase, refuses to mix single and three phase devices
    PerPhaseRealPowerOutput,
}

impl Strategy {
    pub fn for_quantity(quantity: &str) -> Self {
        match quantity {
            REALPOWER_DEFAULT => Strategy::DefaultRealPower,
            q if REALPOWER_OUTPUT.contains(&q) => Strategy::PerPhaseRealPowerOutput,
            _ => Strategy::GenericSum,
        }
    }

    /// Device quantities read when computing `quantity`
    pub fn inputs(quantity: &str) -> Vec<&str> {
        match Self::for_quantity(quantity) {
            Strategy::GenericSum => vec![quantity],
            Strategy::DefaultRealPower => {
                let mut inputs = vec![quantity];
                inputs.extend(REALPOWER_OUTPUT);
                inputs
            }
            Strategy::PerPhaseRealPowerOutput if quantity == REALPOWER_OUTPUT_L2 => vec![quantity],
            Strategy::PerPhaseRealPowerOutput => vec![quantity, REALPOWER_OUTPUT_L2],
        }
    }
}

#[derive(Debug, Clone, Default)]
struct QuantityState {
    changed: bool,
    last_change: Option<i64>,
    last_advertised: Option<i64>,
    /// latest computation could not be done, cached value is stale
    failed: bool,
}

/// Total power calculation unit (rack or DC)
#[derive(Debug, Clone)]
pub struct UnitAggregator {
    name: String,
    /// device -> its measurements, ordered so the "first member" is stable
    devices: BTreeMap<String, MetricCache>,
    computed: MetricCache,
    states: HashMap<String, QuantityState>,
    readvertise_interval: i64,
}

impl UnitAggregator {
    pub fn new(name: impl Into<String>, readvertise_interval: i64) -> Self {
        Self {
            name: name.into(),
            devices: BTreeMap::new(),
            computed: MetricCache::new(),
            states: HashMap::new(),
            readvertise_interval,
        }
    }

    pub fn with_devices<I, S>(name: impl Into<String>, devices: I, readvertise_interval: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unit = Self::new(name, readvertise_interval);
        for device in devices {
            unit.add_power_device(device);
        }
        unit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_power_device(&mut self, device: impl Into<String>) {
        self.devices.entry(device.into()).or_default();
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn has_device(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }

    /// Time to live of the published totals
    pub fn outgoing_ttl(&self) -> i64 {
        6 * self.readvertise_interval
    }

    /// Stores a device reading; readings of non-members are ignored
    pub fn set_measurement(&mut self, sample: MetricSample) -> bool {
        match self.devices.get_mut(&sample.element) {
            Some(cache) => {
                cache.upsert(sample);
                true
            }
            None => false,
        }
    }

    /// Discards expired device readings and expired totals
    pub fn drop_old_measurements(&mut self, now: i64) {
        let mut dropped = 0;
        for cache in self.devices.values_mut() {
            dropped += cache.evict_expired(now);
        }
        dropped += self.computed.evict_expired(now);
        if dropped > 0 {
            trace!("{}: dropped {} expired measurements", self.name, dropped);
        }
    }

    /// Evicts, then computes every listed quantity
    pub fn calculate_all(&mut self, quantities: &[&str], now: i64) {
        self.drop_old_measurements(now);
        for quantity in quantities {
            self.calculate(quantity, now);
        }
    }

    /// Computes one total and records whether it changed. On failure the
    /// previous total is left untouched.
    pub fn calculate(&mut self, quantity: &str, now: i64) -> bool {
        let result = match Strategy::for_quantity(quantity) {
            Strategy::GenericSum => self.simple_summarize(quantity),
            Strategy::DefaultRealPower => self.realpower_default(),
            Strategy::PerPhaseRealPowerOutput => self.realpower_output(quantity),
        };
        match result {
            Ok(value) => {
                self.store(quantity, value, now);
                trace!("{} calculate succeeded", self.topic(quantity));
                true
            }
            Err(e) => {
                debug!("{} calculate failed ({})", self.topic(quantity), e);
                self.states.entry(quantity.to_string()).or_default().failed = true;
                false
            }
        }
    }

    fn store(&mut self, quantity: &str, value: f64, now: i64) {
        let topic = self.topic(quantity);
        let current = self.computed.value(&topic);
        let ttl = self.outgoing_ttl();
        let state = self.states.entry(quantity.to_string()).or_default();
        state.failed = false;

        if value.is_nan() {
            if !current.is_nan() {
                debug!("{} is unknown now", topic);
            }
            state.changed = false;
            self.computed
                .upsert(MetricSample::new(&self.name, quantity, UNIT_WATT, f64::NAN, now, ttl));
            return;
        }

        if current.is_nan() || (current - value).abs() > EPSILON {
            self.computed
                .upsert(MetricSample::new(&self.name, quantity, UNIT_WATT, value, now, ttl));
            state.changed = true;
            state.last_change = Some(now);
        }
    }

    fn simple_summarize(&self, quantity: &str) -> Result<f64> {
        let mut sum = 0.0;
        for (device, cache) in &self.devices {
            let value = cache.value(&topic(quantity, device));
            if value.is_nan() {
                return Err(TpowerError::missing(quantity, device));
            }
            sum += value;
        }
        Ok(sum)
    }

    fn realpower_default(&self) -> Result<f64> {
        let mut sum = 0.0;
        for (device, cache) in &self.devices {
            let value = cache.value(&topic(REALPOWER_DEFAULT, device));
            if !value.is_nan() {
                sum += value;
                continue;
            }
            // realpower.default not present, sum the phases
            for phase in REALPOWER_OUTPUT {
                let value = cache.value(&topic(phase, device));
                if value.is_nan() {
                    return Err(TpowerError::missing(phase, device));
                }
                sum += value;
            }
        }
        Ok(sum)
    }

    fn realpower_output(&self, quantity: &str) -> Result<f64> {
        let mut three_phase: Option<bool> = None;
        for (device, cache) in &self.devices {
            let has_l2 = !cache.value(&topic(REALPOWER_OUTPUT_L2, device)).is_nan();
            match three_phase {
                None => {
                    debug!(
                        "{} calculation: choose {} phases ({}@{})",
                        self.topic(quantity),
                        if has_l2 { 3 } else { 1 },
                        quantity,
                        device
                    );
                    three_phase = Some(has_l2);
                }
                Some(expected) if expected != has_l2 => {
                    debug!("{} calculation: avoid mixed phases ({})", self.topic(quantity), device);
                    return Ok(f64::NAN);
                }
                Some(_) => {}
            }
        }
        self.simple_summarize(quantity)
    }

    fn topic(&self, quantity: &str) -> String {
        topic(quantity, &self.name)
    }

    /// Current total, NaN when unknown
    pub fn value(&self, quantity: &str) -> f64 {
        self.computed.value(&self.topic(quantity))
    }

    pub fn computed(&self, quantity: &str) -> Option<&MetricSample> {
        self.computed.get(&self.topic(quantity))
    }

    pub fn is_known(&self, quantity: &str) -> bool {
        !self.value(quantity).is_nan()
    }

    pub fn changed(&self, quantity: &str) -> bool {
        self.states.get(quantity).map(|s| s.changed).unwrap_or(false)
    }

    pub fn last_change(&self, quantity: &str) -> Option<i64> {
        self.states.get(quantity).and_then(|s| s.last_change)
    }

    /// True when the total should be published now: it is known and fresh,
    /// was not already published during this second, and either changed or
    /// was not published for longer than the re-advertise interval
    pub fn advertise(&self, quantity: &str, now: i64) -> bool {
        let Some(state) = self.states.get(quantity) else {
            return false;
        };
        if state.failed || !self.is_known(quantity) {
            return false;
        }
        if state.last_advertised == Some(now) {
            return false;
        }
        let since_change = state.last_change.map(|t| now - t).unwrap_or(i64::MAX);
        state.changed || since_change > self.readvertise_interval
    }

    /// Records a successful publication
    pub fn advertised(&mut self, quantity: &str, now: i64) {
        let topic = self.topic(quantity);
        let state = self.states.entry(quantity.to_string()).or_default();
        state.changed = false;
        state.last_change = Some(now);
        state.last_advertised = Some(now);
        // a republished total stays alive in the cache
        if let Some(mut sample) = self.computed.get(&topic).cloned() {
            sample.timestamp = now;
            self.computed.upsert(sample);
        }
    }

    /// Records a successful publication of `value`. A total that moved on
    /// while the publication was in flight stays changed.
    pub fn advertised_value(&mut self, quantity: &str, value: f64, now: i64) {
        self.advertised(quantity, now);
        if (self.value(quantity) - value).abs() > EPSILON {
            if let Some(state) = self.states.get_mut(quantity) {
                state.changed = true;
            }
        }
    }

    /// Seconds until the next publication is due, 0 when due now. A total
    /// that is not known backs off for a whole interval.
    pub fn time_to_next_advertisement(&self, quantity: &str, now: i64) -> i64 {
        let interval = self.readvertise_interval;
        let state = match self.states.get(quantity) {
            Some(state) if !state.failed && self.is_known(quantity) => state,
            _ => return interval,
        };
        let Some(last_change) = state.last_change else {
            return interval;
        };
        if state.changed {
            return 0;
        }
        let dt = now - last_change;
        if dt > interval {
            0
        } else {
            interval - dt
        }
    }

    /// Members whose reading for `quantity` is missing or older than twice
    /// its ttl. For messages only.
    pub fn devices_in_unknown_state(&self, quantity: &str, now: i64) -> Vec<String> {
        let unknown = |cache: &MetricCache, q: &str, device: &str| -> bool {
            match cache.get(&topic(q, device)) {
                None => true,
                Some(sample) => sample.value.is_nan() || sample.age(now) > sample.ttl.saturating_mul(2),
            }
        };

        self.devices
            .iter()
            .filter(|&(device, cache)| match Strategy::for_quantity(quantity) {
                Strategy::DefaultRealPower => {
                    unknown(cache, REALPOWER_DEFAULT, device.as_str())
                        && REALPOWER_OUTPUT.iter().any(|&phase| unknown(cache, phase, device.as_str()))
                }
                _ => unknown(cache, quantity, device.as_str()),
            })
            .map(|(device, _)| device.clone())
            .collect()
    }

    /// The total as it goes on the bus
    pub fn outgoing(&self, quantity: &str, now: i64) -> Option<MetricSample> {
        let computed = self.computed(quantity)?;
        if computed.value.is_nan() {
            return None;
        }
        Some(MetricSample::new(
            &self.name,
            quantity,
            UNIT_WATT,
            computed.value,
            now,
            self.outgoing_ttl(),
        ))
    }
}
