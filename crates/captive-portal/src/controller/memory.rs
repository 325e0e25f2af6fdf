//! In-memory controller collaborators
//!
//! These stand in for a live SDN controller: hosts are added and moved by
//! hand, rules are recorded instead of pushed to switches, and emitted
//! packets are kept for inspection.

use super::rules::{AppId, ForwardingRule, RuleHandle, RuleId, TrafficSelector, TrafficTreatment};
use super::{HostDirectory, HostEvent, HostEventKind, InboundPacket, PacketIo, RuleBackend};
use crate::error::{Error, Result};
use crate::models::{ConnectPoint, DeviceId, Host, HostId};
use async_channel::{Receiver, Sender};
use indexmap::IndexMap;
use pnet::util::MacAddr;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Fan a message out to every live subscriber, forgetting closed ones
fn broadcast<T: Clone>(subscribers: &RwLock<Vec<Sender<T>>>, message: T) {
    write(subscribers).retain(|tx| tx.try_send(message.clone()).is_ok());
}

/// In-memory host directory
pub struct MemoryHostDirectory {
    hosts: RwLock<HashMap<HostId, Host>>,
    subscribers: RwLock<Vec<Sender<HostEvent>>>,
}

impl MemoryHostDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Add a host, or update it if its MAC is already known
    ///
    /// Emits `Added` for new hosts, `Moved` when the attachment point changed
    /// and `Updated` when only the addresses changed.
    pub fn add_host(&self, host: Host) {
        let previous = write(&self.hosts).insert(host.id(), host.clone());
        let event = match previous {
            None => HostEvent::new(HostEventKind::Added, host),
            Some(prev) if prev == host => return,
            Some(prev) if prev.location != host.location => {
                HostEvent::new(HostEventKind::Moved, host).with_previous(prev)
            }
            Some(prev) => HostEvent::new(HostEventKind::Updated, host).with_previous(prev),
        };
        debug!("Host event {:?} for {}", event.kind, event.subject.mac);
        broadcast(&self.subscribers, event);
    }

    /// Move a known host to a new attachment point
    pub fn move_host(&self, mac: MacAddr, location: ConnectPoint) -> Option<Host> {
        let mut host = read(&self.hosts).get(&HostId(mac)).cloned()?;
        host.location = location;
        self.add_host(host.clone());
        Some(host)
    }

    /// Forget a host
    pub fn remove_host(&self, mac: MacAddr) -> Option<Host> {
        let host = write(&self.hosts).remove(&HostId(mac))?;
        broadcast(
            &self.subscribers,
            HostEvent::new(HostEventKind::Removed, host.clone()),
        );
        Some(host)
    }
}

impl Default for MemoryHostDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDirectory for MemoryHostDirectory {
    fn hosts(&self) -> Vec<Host> {
        read(&self.hosts).values().cloned().collect()
    }

    fn hosts_by_ip(&self, ip: IpAddr) -> Vec<Host> {
        read(&self.hosts)
            .values()
            .filter(|h| h.has_ip(ip))
            .cloned()
            .collect()
    }

    fn hosts_by_mac(&self, mac: MacAddr) -> Vec<Host> {
        read(&self.hosts).get(&HostId(mac)).cloned().into_iter().collect()
    }

    fn subscribe(&self) -> Receiver<HostEvent> {
        let (tx, rx) = async_channel::unbounded();
        write(&self.subscribers).push(tx);
        rx
    }
}

/// Rule backend that records rules instead of programming devices
pub struct MemoryRuleBackend {
    next_id: AtomicU64,
    rules: RwLock<IndexMap<RuleId, ForwardingRule>>,
    rejected_devices: RwLock<HashSet<DeviceId>>,
    installs: AtomicUsize,
    retractions: AtomicUsize,
}

impl MemoryRuleBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            rules: RwLock::new(IndexMap::new()),
            rejected_devices: RwLock::new(HashSet::new()),
            installs: AtomicUsize::new(0),
            retractions: AtomicUsize::new(0),
        }
    }

    /// Refuse every rule submitted for `device`
    pub fn reject_device(&self, device: DeviceId) {
        write(&self.rejected_devices).insert(device);
    }

    /// Rules currently installed, in installation order
    pub fn rules(&self) -> Vec<ForwardingRule> {
        read(&self.rules).values().cloned().collect()
    }

    /// Rules currently installed on one device
    pub fn rules_on(&self, device: &DeviceId) -> Vec<ForwardingRule> {
        read(&self.rules)
            .values()
            .filter(|r| &r.device == device)
            .cloned()
            .collect()
    }

    /// Number of rules currently installed
    pub fn len(&self) -> usize {
        read(&self.rules).len()
    }

    /// True when no rule is installed
    pub fn is_empty(&self) -> bool {
        read(&self.rules).is_empty()
    }

    /// Total number of accepted installs
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::Relaxed)
    }

    /// Total number of retractions of installed rules
    pub fn retract_count(&self) -> usize {
        self.retractions.load(Ordering::Relaxed)
    }
}

impl Default for MemoryRuleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBackend for MemoryRuleBackend {
    fn install(&self, rule: ForwardingRule) -> Result<RuleHandle> {
        if read(&self.rejected_devices).contains(&rule.device) {
            return Err(Error::backend(format!("device {} rejected rule", rule.device)));
        }
        let id = RuleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = RuleHandle::for_rule(id, &rule);
        write(&self.rules).insert(id, rule);
        self.installs.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn retract(&self, handle: &RuleHandle) -> Result<()> {
        if write(&self.rules).shift_remove(&handle.id).is_some() {
            self.retractions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn retract_all_by_app(&self, app_id: &AppId) -> Result<()> {
        let mut rules = write(&self.rules);
        let before = rules.len();
        rules.retain(|_, rule| &rule.app_id != app_id);
        self.retractions
            .fetch_add(before - rules.len(), Ordering::Relaxed);
        Ok(())
    }
}

/// A packet sent out by the engine
#[derive(Debug, Clone)]
pub struct EmittedPacket {
    /// Device the packet was sent from
    pub device: DeviceId,
    /// Treatment applied on emission
    pub treatment: TrafficTreatment,
    /// Raw frame
    pub data: Vec<u8>,
}

/// Packet service that records emissions and lets tests inject packets
pub struct MemoryPacketIo {
    subscribers: RwLock<Vec<Sender<InboundPacket>>>,
    emitted: RwLock<Vec<EmittedPacket>>,
    interceptions: RwLock<Vec<(TrafficSelector, u16)>>,
}

impl MemoryPacketIo {
    /// Create a packet service with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            emitted: RwLock::new(Vec::new()),
            interceptions: RwLock::new(Vec::new()),
        }
    }

    /// Deliver a packet to every subscriber
    pub fn inject(&self, packet: InboundPacket) {
        broadcast(&self.subscribers, packet);
    }

    /// Packets emitted so far
    pub fn emitted(&self) -> Vec<EmittedPacket> {
        read(&self.emitted).clone()
    }

    /// Active interception requests
    pub fn interceptions(&self) -> Vec<(TrafficSelector, u16)> {
        read(&self.interceptions).clone()
    }
}

impl Default for MemoryPacketIo {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIo for MemoryPacketIo {
    fn subscribe(&self) -> Receiver<InboundPacket> {
        let (tx, rx) = async_channel::unbounded();
        write(&self.subscribers).push(tx);
        rx
    }

    fn emit(&self, device: &DeviceId, treatment: TrafficTreatment, data: Vec<u8>) -> Result<()> {
        write(&self.emitted).push(EmittedPacket {
            device: device.clone(),
            treatment,
            data,
        });
        Ok(())
    }

    fn request_interception(&self, selector: TrafficSelector, priority: u16) -> Result<()> {
        let mut interceptions = write(&self.interceptions);
        if !interceptions.iter().any(|(s, _)| s == &selector) {
            interceptions.push((selector, priority));
        }
        Ok(())
    }

    fn cancel_interception(&self, selector: &TrafficSelector) -> Result<()> {
        write(&self.interceptions).retain(|(s, _)| s != selector);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::rules::{DEFAULT_TABLE, RuleTimeout};

    fn host(last: u8, device: &str, port: u32) -> Host {
        Host::new(
            MacAddr::new(0, 0, 0, 0, 0, last),
            [format!("10.0.0.{}", last).parse().unwrap()],
            ConnectPoint::new(device, port),
        )
        .unwrap()
    }

    #[test]
    fn test_host_directory_events() {
        let directory = MemoryHostDirectory::new();
        let events = directory.subscribe();

        directory.add_host(host(1, "of:1", 1));
        directory.add_host(host(1, "of:1", 1));
        directory.move_host(MacAddr::new(0, 0, 0, 0, 0, 1), ConnectPoint::new("of:2", 4));
        directory.remove_host(MacAddr::new(0, 0, 0, 0, 0, 1));

        let kinds: Vec<HostEventKind> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                HostEventKind::Added,
                HostEventKind::Moved,
                HostEventKind::Removed
            ]
        );
        assert!(directory.hosts().is_empty());
    }

    #[test]
    fn test_host_lookup() {
        let directory = MemoryHostDirectory::new();
        directory.add_host(host(1, "of:1", 1));
        directory.add_host(host(2, "of:1", 2));

        assert_eq!(directory.hosts_by_ip("10.0.0.2".parse().unwrap()).len(), 1);
        assert!(directory.hosts_by_ip("10.0.0.3".parse().unwrap()).is_empty());
        assert_eq!(
            directory.hosts_by_mac(MacAddr::new(0, 0, 0, 0, 0, 1))[0].location.port,
            1
        );
    }

    #[test]
    fn test_rule_backend_bookkeeping() {
        let backend = MemoryRuleBackend::new();
        let rule = |device: &str| ForwardingRule {
            app_id: AppId::new("portal"),
            device: DeviceId::new(device),
            selector: TrafficSelector::ipv4(),
            treatment: TrafficTreatment::output(1),
            priority: 10,
            timeout: RuleTimeout::Permanent,
            table: DEFAULT_TABLE,
        };

        let first = backend.install(rule("of:1")).unwrap();
        backend.install(rule("of:2")).unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.rules_on(&DeviceId::new("of:1")).len(), 1);

        backend.retract(&first).unwrap();
        backend.retract(&first).unwrap();
        assert_eq!(backend.retract_count(), 1);

        backend.reject_device(DeviceId::new("of:3"));
        assert!(backend.install(rule("of:3")).is_err());

        backend.retract_all_by_app(&AppId::new("portal")).unwrap();
        assert!(backend.is_empty());
        assert_eq!(backend.install_count(), 2);
        assert_eq!(backend.retract_count(), 2);
    }
}
