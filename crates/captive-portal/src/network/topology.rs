//! In-memory network topology

use crate::controller::{DeviceDirectory, TopologyOracle};
use crate::models::{ConnectPoint, DeviceId, Link, Path};
use std::collections::{BTreeSet, HashSet};
use std::sync::{PoisonError, RwLock};

/// Network topology graph of devices and unidirectional links
///
/// Path queries enumerate every simple path between two devices and return
/// them shortest first, so the first path handed out is a shortest one.
#[derive(Debug, Default)]
pub struct GraphTopology {
    devices: RwLock<BTreeSet<DeviceId>>,
    links: RwLock<Vec<Link>>,
}

impl GraphTopology {
    /// Create a new empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device without links
    pub fn add_device(&self, device: impl Into<DeviceId>) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.into());
    }

    /// Add a unidirectional link; both ends become known devices
    pub fn add_link(&self, link: Link) {
        self.add_device(link.src.device.clone());
        self.add_device(link.dst.device.clone());

        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if !links.contains(&link) {
            links.push(link);
        }
    }

    /// Add a link in both directions
    pub fn add_bidirectional_link(&self, a: ConnectPoint, b: ConnectPoint) {
        self.add_link(Link::new(a.clone(), b.clone()));
        self.add_link(Link::new(b, a));
    }

    /// Remove every link touching the given connect point
    pub fn remove_links_at(&self, point: &ConnectPoint) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| &l.src != point && &l.dst != point);
    }

    /// Get all links
    pub fn links(&self) -> Vec<Link> {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn walk(
        links: &[Link],
        current: &DeviceId,
        dst: &DeviceId,
        visited: &mut HashSet<DeviceId>,
        trail: &mut Vec<Link>,
        found: &mut Vec<Path>,
    ) {
        if current == dst {
            found.push(Path::new(trail.clone()));
            return;
        }
        for link in links.iter().filter(|l| &l.src.device == current) {
            if !visited.insert(link.dst.device.clone()) {
                continue;
            }
            trail.push(link.clone());
            Self::walk(links, &link.dst.device, dst, visited, trail, found);
            trail.pop();
            visited.remove(&link.dst.device);
        }
    }
}

impl TopologyOracle for GraphTopology {
    fn paths(&self, src: &DeviceId, dst: &DeviceId) -> Vec<Path> {
        if src == dst {
            return Vec::new();
        }

        let links = self.links();
        let mut visited = HashSet::from([src.clone()]);
        let mut found = Vec::new();
        Self::walk(&links, src, dst, &mut visited, &mut Vec::new(), &mut found);

        // Stable: equal-length paths keep link insertion order
        found.sort_by_key(Path::len);
        found
    }
}

impl DeviceDirectory for GraphTopology {
    fn devices(&self) -> Vec<DeviceId> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
