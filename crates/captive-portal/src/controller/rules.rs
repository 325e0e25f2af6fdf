//! Forwarding rule value types
//!
//! Rules are plain values: a selector describing which packets match, a
//! treatment describing what the device does with them, and the bookkeeping
//! (priority, timeout, table, owning application) the rule backend needs.

use crate::models::{DeviceId, PortNumber};
use ipnet::Ipv4Net;
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// EtherType of IPv4 frames
pub const ETH_TYPE_IPV4: u16 = 0x0800;

/// IP protocol number of TCP
pub const IP_PROTO_TCP: u8 = 6;

/// IP protocol number of UDP
pub const IP_PROTO_UDP: u8 = 17;

/// Flow table every rule of this engine is placed in
pub const DEFAULT_TABLE: u8 = 0;

/// Application owning a set of rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    /// Create an application id
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-assigned rule identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub u64);

/// Match fields of a rule; `None` means wildcard
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficSelector {
    /// Ingress port
    pub in_port: Option<PortNumber>,
    /// EtherType
    pub eth_type: Option<u16>,
    /// Source MAC
    pub eth_src: Option<MacAddr>,
    /// Destination MAC
    pub eth_dst: Option<MacAddr>,
    /// Source IPv4 prefix
    pub ip_src: Option<Ipv4Net>,
    /// Destination IPv4 prefix
    pub ip_dst: Option<Ipv4Net>,
    /// IP protocol number
    pub ip_proto: Option<u8>,
    /// Transport source port
    pub tp_src: Option<u16>,
    /// Transport destination port
    pub tp_dst: Option<u16>,
}

impl TrafficSelector {
    /// Selector matching every IPv4 frame
    pub fn ipv4() -> Self {
        Self {
            eth_type: Some(ETH_TYPE_IPV4),
            ..Self::default()
        }
    }

    /// Exact-match prefix for a single address
    pub fn host_prefix(ip: Ipv4Addr) -> Option<Ipv4Net> {
        Some(Ipv4Net::from(ip))
    }
}

/// Where a treated packet leaves the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    /// Out of a physical port
    Port(PortNumber),
    /// Back through the device's flow table
    Table,
}

/// Actions applied to matching packets
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficTreatment {
    /// Rewrite source MAC
    pub set_eth_src: Option<MacAddr>,
    /// Rewrite destination MAC
    pub set_eth_dst: Option<MacAddr>,
    /// Rewrite source IPv4 address
    pub set_ip_src: Option<Ipv4Addr>,
    /// Rewrite destination IPv4 address
    pub set_ip_dst: Option<Ipv4Addr>,
    /// Output action; `None` drops
    pub output: Option<Output>,
}

impl TrafficTreatment {
    /// Treatment that only forwards out of `port`
    pub fn output(port: PortNumber) -> Self {
        Self {
            output: Some(Output::Port(port)),
            ..Self::default()
        }
    }

    /// Treatment that resubmits the packet to the flow table
    pub fn table() -> Self {
        Self {
            output: Some(Output::Table),
            ..Self::default()
        }
    }
}

/// Rule lifetime on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTimeout {
    /// Never expires
    Permanent,
    /// Expires after the given number of idle seconds
    Idle(u16),
}

/// A forwarding rule to be placed on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Owning application
    pub app_id: AppId,
    /// Target device
    pub device: DeviceId,
    /// Match fields
    pub selector: TrafficSelector,
    /// Actions
    pub treatment: TrafficTreatment,
    /// Rule priority
    pub priority: u16,
    /// Rule lifetime
    pub timeout: RuleTimeout,
    /// Flow table
    pub table: u8,
}

/// Reference to one installed rule, sufficient to retract it later
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleHandle {
    /// Backend-assigned id
    pub id: RuleId,
    /// Device the rule lives on
    pub device: DeviceId,
    /// Match fields of the rule
    pub selector: TrafficSelector,
    /// Rule priority
    pub priority: u16,
}

impl RuleHandle {
    /// Handle for a rule the backend accepted under `id`
    pub fn for_rule(id: RuleId, rule: &ForwardingRule) -> Self {
        Self {
            id,
            device: rule.device.clone(),
            selector: rule.selector.clone(),
            priority: rule.priority,
        }
    }
}
