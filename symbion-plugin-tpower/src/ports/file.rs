//! YAML topology description, re-read on every reload.
//!
//! ```yaml
//! devices:
//!   - { name: ups-1, kind: ups }
//!   - { name: epdu-1, kind: epdu, status: retired }
//! containers:
//!   - { id: 1, name: rack-1, type: rack, devices: [ups-1, epdu-1] }
//! links:
//!   - { src: feed-A, dst: ups-1 }
//! ```

use super::TopologySource;
use crate::error::{Result, TpowerError};
use crate::topology::{Container, ContainerKind, DeviceInfo, DeviceKind, PowerLink};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
struct DeviceEntry {
    name: String,
    kind: DeviceKind,
    #[serde(default = "default_status")]
    status: String,
}

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ContainerEntry {
    id: u32,
    name: String,
    #[serde(rename = "type")]
    kind: ContainerKind,
    #[serde(default)]
    devices: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    devices: Vec<DeviceEntry>,
    #[serde(default)]
    containers: Vec<ContainerEntry>,
    #[serde(default)]
    links: Vec<PowerLink>,
}

/// Topology source backed by a YAML file
///
/// `containers()` parses the file and keeps the result; the device and link
/// queries of the same reload answer from that snapshot so one reload never
/// mixes two versions of the file.
pub struct FileTopologySource {
    path: PathBuf,
    snapshot: Mutex<Option<TopologyFile>>,
}

impl FileTopologySource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            snapshot: Mutex::new(None),
        }
    }

    fn load_from_disk(&self) -> Result<TopologyFile> {
        let content = fs::read_to_string(&self.path).map_err(|e| {
            TpowerError::TopologyUnavailable(format!("cannot read {:?}: {}", self.path, e))
        })?;
        if content.trim().is_empty() {
            return Ok(TopologyFile::default());
        }
        let file: TopologyFile = serde_yaml::from_str(&content)?;
        debug!(
            "topology file {:?}: {} devices, {} containers, {} links",
            self.path,
            file.devices.len(),
            file.containers.len(),
            file.links.len()
        );
        Ok(file)
    }

    fn with_container<T>(
        &self,
        container: &Container,
        f: impl FnOnce(&TopologyFile, &ContainerEntry) -> T,
    ) -> Result<T> {
        let guard = self.snapshot.lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| TpowerError::TopologyUnavailable("containers were not listed yet".into()))?;
        let entry = file
            .containers
            .iter()
            .find(|c| c.id == container.id)
            .ok_or_else(|| TpowerError::TopologyUnavailable(format!("container {} vanished", container.name)))?;
        Ok(f(file, entry))
    }
}

fn active_members(file: &TopologyFile, entry: &ContainerEntry) -> Vec<DeviceInfo> {
    let known: HashMap<&str, &DeviceEntry> = file.devices.iter().map(|d| (d.name.as_str(), d)).collect();
    let mut members = Vec::with_capacity(entry.devices.len());
    for name in &entry.devices {
        match known.get(name.as_str()) {
            Some(device) if device.status == "active" => {
                members.push(DeviceInfo::new(name.clone(), device.kind));
            }
            Some(device) => {
                debug!("'{}': skipping {} ({})", entry.name, name, device.status);
            }
            None => {
                warn!("'{}': device {} is not described, treated as other", entry.name, name);
                members.push(DeviceInfo::new(name.clone(), DeviceKind::Other));
            }
        }
    }
    members
}

impl TopologySource for FileTopologySource {
    fn containers(&self, kind: ContainerKind) -> Result<Vec<Container>> {
        let file = self.load_from_disk()?;
        let containers = file
            .containers
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| Container {
                id: c.id,
                name: c.name.clone(),
                kind: c.kind,
            })
            .collect();
        *self.snapshot.lock() = Some(file);
        Ok(containers)
    }

    fn devices(&self, container: &Container) -> Result<Vec<DeviceInfo>> {
        self.with_container(container, active_members)
    }

    fn links(&self, container: &Container) -> Result<Vec<PowerLink>> {
        self.with_container(container, |file, entry| {
            let members: BTreeSet<String> = active_members(file, entry)
                .into_iter()
                .map(|d| d.name)
                .collect();
            file.links
                .iter()
                .filter(|l| members.contains(&l.src) || members.contains(&l.dst))
                .cloned()
                .collect()
        })
    }
}
