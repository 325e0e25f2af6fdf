//! Seams to the SDN controller
//!
//! The engine never talks to switches directly. Everything it knows about
//! devices, hosts, topology and packet I/O comes through the traits below,
//! and every rule it wants on a device goes through [`RuleBackend`]. The
//! calls are synchronous: they are expected to return as fast as the
//! controller's own in-memory services do.

pub mod memory;
pub mod rules;

use crate::error::Result;
use crate::models::{ConnectPoint, DeviceId, Host, Path};
use async_channel::Receiver;
use pnet::util::MacAddr;
use rules::{AppId, ForwardingRule, RuleHandle, TrafficSelector, TrafficTreatment};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub use memory::{MemoryHostDirectory, MemoryPacketIo, MemoryRuleBackend};

/// Devices known to the controller
pub trait DeviceDirectory: Send + Sync {
    /// List every device
    fn devices(&self) -> Vec<DeviceId>;
}

/// Host identities and their attachment points
pub trait HostDirectory: Send + Sync {
    /// Every known host
    fn hosts(&self) -> Vec<Host>;

    /// Hosts owning the given address
    fn hosts_by_ip(&self, ip: IpAddr) -> Vec<Host>;

    /// Hosts with the given hardware address
    fn hosts_by_mac(&self, mac: MacAddr) -> Vec<Host>;

    /// Subscribe to host lifecycle events
    fn subscribe(&self) -> Receiver<HostEvent>;
}

/// Path computation over the current topology snapshot
pub trait TopologyOracle: Send + Sync {
    /// Simple paths from `src` to `dst`; order is significant
    fn paths(&self, src: &DeviceId, dst: &DeviceId) -> Vec<Path>;
}

/// Accepts and retracts forwarding rules
pub trait RuleBackend: Send + Sync {
    /// Submit a rule; returns the handle used to retract it
    fn install(&self, rule: ForwardingRule) -> Result<RuleHandle>;

    /// Retract one rule
    fn retract(&self, handle: &RuleHandle) -> Result<()>;

    /// Retract every rule owned by the application
    fn retract_all_by_app(&self, app_id: &AppId) -> Result<()>;
}

/// Packet-in / packet-out service
pub trait PacketIo: Send + Sync {
    /// Receive packets punted to the controller
    fn subscribe(&self) -> Receiver<InboundPacket>;

    /// Send a packet out of `device` with the given treatment
    fn emit(&self, device: &DeviceId, treatment: TrafficTreatment, data: Vec<u8>) -> Result<()>;

    /// Ask devices to punt matching packets to the controller
    fn request_interception(&self, selector: TrafficSelector, priority: u16) -> Result<()>;

    /// Withdraw an interception request
    fn cancel_interception(&self, selector: &TrafficSelector) -> Result<()>;
}

/// Host lifecycle event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    /// Host appeared
    Added,
    /// Host attachment point changed
    Moved,
    /// Host addresses changed
    Updated,
    /// Host disappeared
    Removed,
}

/// Host lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    /// What happened
    pub kind: HostEventKind,
    /// Host state after the event (before it, for removals)
    pub subject: Host,
    /// Host state before a move or update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<Host>,
}

impl HostEvent {
    /// Create an event without previous state
    pub fn new(kind: HostEventKind, subject: Host) -> Self {
        Self {
            kind,
            subject,
            previous: None,
        }
    }

    /// Attach the state the host had before the event
    pub fn with_previous(mut self, previous: Host) -> Self {
        self.previous = Some(previous);
        self
    }
}

/// A packet punted to the controller
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// Where the packet entered the network
    pub receiver: ConnectPoint,
    /// Raw Ethernet frame
    pub data: Vec<u8>,
}

impl InboundPacket {
    /// Create an inbound packet
    pub fn new(receiver: ConnectPoint, data: Vec<u8>) -> Self {
        Self { receiver, data }
    }
}
