//! Power topology: which devices of a container are summed for its total.
//!
//! A rack or a datacenter holds a set of devices wired by directed power
//! links (`src` powers `dst`). Summing every device would count the same watts
//! several times along a chain (UPS -> PDU -> ePDU), so for each container we
//! walk the chain from its entry points and keep the first device that
//! measures what flows into the container:
//!
//! ```text
//!            +---------------------------+
//!   feed ----|--> ups --> pdu --> epdu-1 |
//!            |                \-> epdu-2 |
//!            +---------------------------+
//!   ups powers nothing outside -> ups is the representative
//! ```
//!
//! The walk tolerates cycles: a device that has been on the border once never
//! goes back onto it.

use crate::error::Result;
use crate::ports::TopologySource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Rack,
    Datacenter,
}

impl ContainerKind {
    pub const ALL: [ContainerKind; 2] = [ContainerKind::Rack, ContainerKind::Datacenter];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Rack => "rack",
            ContainerKind::Datacenter => "datacenter",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device subtype, only ups and epdu can represent a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Ups,
    Epdu,
    Pdu,
    Sts,
    Feed,
    Genset,
    Server,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Power flows from `src` to `dst`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PowerLink {
    pub src: String,
    pub dst: String,
}

impl PowerLink {
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self { src: src.into(), dst: dst.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ContainerKind,
}

/// One container with its members and the links touching it, as returned by
/// the topology source
#[derive(Debug, Clone)]
pub struct ContainerTopology {
    pub container: Container,
    pub devices: Vec<DeviceInfo>,
    pub links: Vec<PowerLink>,
}

impl ContainerTopology {
    /// Devices whose readings make up this container's total
    pub fn representatives(&self) -> Vec<String> {
        resolve_representatives(&self.container.name, &self.devices, &self.links)
    }
}

/// Border walk over one container.
///
/// Border = members without an incoming in-container link, plus members fed
/// from outside. A border epdu, or a border ups powering nothing outside the
/// container, is accepted; any other border device is replaced by its
/// in-container downstream devices. Dead ends simply drop out.
pub fn resolve_representatives(
    container: &str,
    devices: &[DeviceInfo],
    links: &[PowerLink],
) -> Vec<String> {
    if devices.is_empty() {
        info!("'{}': has no devices", container);
        return Vec::new();
    }
    if links.is_empty() {
        info!("'{}': has no power links", container);
        return Vec::new();
    }

    let members: BTreeMap<&str, DeviceKind> =
        devices.iter().map(|d| (d.name.as_str(), d.kind)).collect();

    let mut fed_inside: HashSet<&str> = HashSet::new();
    let mut border: BTreeSet<&str> = BTreeSet::new();
    for link in links {
        let src_inside = members.contains_key(link.src.as_str());
        let dst_inside = members.contains_key(link.dst.as_str());
        match (src_inside, dst_inside) {
            (true, true) => {
                fed_inside.insert(link.dst.as_str());
            }
            (false, true) => {
                border.insert(link.dst.as_str());
            }
            (true, false) => {}
            (false, false) => {
                warn!(
                    "'{}': link {} -> {} does not touch the container, ignored",
                    container, link.src, link.dst
                );
            }
        }
    }
    for name in members.keys() {
        if !fed_inside.contains(name) {
            border.insert(*name);
        }
    }

    let mut result = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    while !border.is_empty() {
        seen.extend(border.iter().copied());
        let mut next: BTreeSet<&str> = BTreeSet::new();

        for device in &border {
            let kind = members[device];
            let accepted = match kind {
                DeviceKind::Epdu => true,
                DeviceKind::Ups => !powers_outside(device, &members, links),
                _ => false,
            };
            if accepted {
                debug!("'{}': {} {:?} is representative", container, device, kind);
                result.push(device.to_string());
                continue;
            }
            for link in links.iter().filter(|l| l.src == *device) {
                let dst = link.dst.as_str();
                if members.contains_key(dst) && !seen.contains(dst) {
                    next.insert(dst);
                }
            }
        }
        border = next;
    }

    debug!("'{}': summing {:?}", container, result);
    result
}

fn powers_outside(device: &str, members: &BTreeMap<&str, DeviceKind>, links: &[PowerLink]) -> bool {
    links
        .iter()
        .any(|l| l.src == device && !members.contains_key(l.dst.as_str()))
}

/// Representative devices for one container, ready to become a unit
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContainer {
    pub container: Container,
    pub devices: Vec<String>,
}

/// Queries every container of one kind and resolves its representatives.
///
/// Failing to list the containers fails the whole load. A failed device or
/// link query only empties that one container.
pub fn resolve_all(source: &dyn TopologySource, kind: ContainerKind) -> Result<Vec<ResolvedContainer>> {
    let containers = source.containers(kind)?;
    debug!("loaded {} {} containers", containers.len(), kind);

    let mut resolved = Vec::with_capacity(containers.len());
    for container in containers {
        let devices = match source.devices(&container) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("'{}': problems appeared in selecting devices: {}", container.name, e);
                resolved.push(ResolvedContainer { container, devices: Vec::new() });
                continue;
            }
        };
        let links = match source.links(&container) {
            Ok(links) => links,
            Err(e) => {
                warn!("'{}': problems appeared in selecting power links: {}", container.name, e);
                resolved.push(ResolvedContainer { container, devices: Vec::new() });
                continue;
            }
        };

        let topology = ContainerTopology { container, devices, links };
        let devices = topology.representatives();
        resolved.push(ResolvedContainer { container: topology.container, devices });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TpowerError;

    fn dev(name: &str, kind: DeviceKind) -> DeviceInfo {
        DeviceInfo::new(name, kind)
    }

    fn link(src: &str, dst: &str) -> PowerLink {
        PowerLink::new(src, dst)
    }

    #[test]
    fn test_no_links_yields_nothing() {
        let devices = vec![dev("epdu-1", DeviceKind::Epdu), dev("epdu-2", DeviceKind::Epdu)];
        assert!(resolve_representatives("rack-1", &devices, &[]).is_empty());
    }

    #[test]
    fn test_no_devices_yields_nothing() {
        assert!(resolve_representatives("rack-1", &[], &[link("a", "b")]).is_empty());
    }

    #[test]
    fn test_ups_heading_the_chain_is_taken_alone() {
        let devices = vec![
            dev("ups-1", DeviceKind::Ups),
            dev("pdu-1", DeviceKind::Pdu),
            dev("epdu-1", DeviceKind::Epdu),
        ];
        let links = vec![link("feed-A", "ups-1"), link("ups-1", "pdu-1"), link("pdu-1", "epdu-1")];
        assert_eq!(resolve_representatives("rack-1", &devices, &links), vec!["ups-1"]);
    }

    #[test]
    fn test_dumb_pdu_is_walked_through() {
        let devices = vec![
            dev("pdu-1", DeviceKind::Pdu),
            dev("epdu-1", DeviceKind::Epdu),
            dev("epdu-2", DeviceKind::Epdu),
        ];
        let links = vec![link("pdu-1", "epdu-1"), link("pdu-1", "epdu-2")];
        assert_eq!(resolve_representatives("rack-1", &devices, &links), vec!["epdu-1", "epdu-2"]);
    }

    #[test]
    fn test_ups_powering_another_rack_is_skipped() {
        let devices = vec![dev("ups-1", DeviceKind::Ups), dev("epdu-1", DeviceKind::Epdu)];
        let links = vec![link("ups-1", "epdu-1"), link("ups-1", "epdu-in-rack-2")];
        assert_eq!(resolve_representatives("rack-1", &devices, &links), vec!["epdu-1"]);
    }

    #[test]
    fn test_device_fed_from_outside_is_a_border_device() {
        // epdu-2 has an in-container feeder and an outside one
        let devices = vec![
            dev("server-1", DeviceKind::Server),
            dev("epdu-2", DeviceKind::Epdu),
        ];
        let links = vec![link("server-1", "epdu-2"), link("pdu-remote", "epdu-2")];
        assert_eq!(resolve_representatives("rack-1", &devices, &links), vec!["epdu-2"]);
    }

    #[test]
    fn test_dead_end_contributes_nothing() {
        let devices = vec![dev("sts-1", DeviceKind::Sts), dev("server-1", DeviceKind::Server)];
        let links = vec![link("sts-1", "server-1")];
        assert!(resolve_representatives("rack-1", &devices, &links).is_empty());
    }

    #[test]
    fn test_two_node_cycle_terminates() {
        let devices = vec![dev("pdu-a", DeviceKind::Pdu), dev("pdu-b", DeviceKind::Pdu)];
        let links = vec![link("feed", "pdu-a"), link("pdu-a", "pdu-b"), link("pdu-b", "pdu-a")];
        assert!(resolve_representatives("rack-1", &devices, &links).is_empty());
    }

    #[test]
    fn test_cycle_below_a_measuring_device() {
        let devices = vec![
            dev("pdu-a", DeviceKind::Pdu),
            dev("pdu-b", DeviceKind::Pdu),
            dev("epdu-1", DeviceKind::Epdu),
        ];
        let links = vec![
            link("feed", "pdu-a"),
            link("pdu-a", "pdu-b"),
            link("pdu-b", "pdu-a"),
            link("pdu-b", "epdu-1"),
        ];
        assert_eq!(resolve_representatives("rack-1", &devices, &links), vec!["epdu-1"]);
    }

    #[test]
    fn test_device_reached_twice_is_summed_once() {
        let devices = vec![
            dev("pdu-a", DeviceKind::Pdu),
            dev("pdu-b", DeviceKind::Pdu),
            dev("epdu-1", DeviceKind::Epdu),
        ];
        // pdu-b is both a border device and downstream of pdu-a
        let links = vec![
            link("feed", "pdu-a"),
            link("feed", "pdu-b"),
            link("pdu-a", "pdu-b"),
            link("pdu-a", "epdu-1"),
            link("pdu-b", "epdu-1"),
        ];
        assert_eq!(resolve_representatives("rack-1", &devices, &links), vec!["epdu-1"]);
    }

    struct FlakySource;

    impl TopologySource for FlakySource {
        fn containers(&self, kind: ContainerKind) -> Result<Vec<Container>> {
            Ok(vec![
                Container { id: 1, name: "rack-ok".into(), kind },
                Container { id: 2, name: "rack-broken".into(), kind },
            ])
        }

        fn devices(&self, container: &Container) -> Result<Vec<DeviceInfo>> {
            if container.id == 2 {
                return Err(TpowerError::TopologyUnavailable("device query failed".into()));
            }
            Ok(vec![dev("epdu-1", DeviceKind::Epdu)])
        }

        fn links(&self, _container: &Container) -> Result<Vec<PowerLink>> {
            Ok(vec![link("feed", "epdu-1")])
        }
    }

    #[test]
    fn test_failed_container_query_only_empties_that_container() {
        let resolved = resolve_all(&FlakySource, ContainerKind::Rack).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].devices, vec!["epdu-1"]);
        assert!(resolved[1].devices.is_empty());
    }
}
