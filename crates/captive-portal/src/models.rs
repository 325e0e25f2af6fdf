//! Data models for the captive portal engine

use crate::controller::rules::RuleHandle;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Port number on a network device
pub type PortNumber = u32;

/// Identifier of a forwarding device (switch)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A (device, port) pair: where a host or a link end attaches to the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectPoint {
    /// Device the point belongs to
    pub device: DeviceId,
    /// Port on that device
    pub port: PortNumber,
}

impl ConnectPoint {
    /// Create a connect point
    pub fn new(device: impl Into<DeviceId>, port: PortNumber) -> Self {
        Self {
            device: device.into(),
            port,
        }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

/// Unidirectional link between two devices
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    /// Egress side
    pub src: ConnectPoint,
    /// Ingress side
    pub dst: ConnectPoint,
}

impl Link {
    /// Create a link
    pub fn new(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self { src, dst }
    }
}

/// Ordered list of device-to-device links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// Links from the source device to the destination device
    pub links: Vec<Link>,
}

impl Path {
    /// Create a path from its links
    pub fn new(links: Vec<Link>) -> Self {
        Self { links }
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// True for a path without links
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// First link of the path
    pub fn first(&self) -> Option<&Link> {
        self.links.first()
    }
}

/// Stable host identity (the host's MAC address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub MacAddr);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a network endpoint as reported by the host directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Hardware address
    pub mac: MacAddr,
    /// All IP addresses observed for this host
    pub ips: BTreeSet<IpAddr>,
    /// Current attachment point
    pub location: ConnectPoint,
}

impl Host {
    /// Create a host snapshot
    pub fn new(
        mac: MacAddr,
        ips: impl IntoIterator<Item = IpAddr>,
        location: ConnectPoint,
    ) -> Result<Self> {
        let ips: BTreeSet<IpAddr> = ips.into_iter().collect();
        if ips.is_empty() {
            return Err(Error::invalid(format!("host {} has no IP address", mac)));
        }
        if mac == MacAddr::zero() || mac == MacAddr::broadcast() {
            return Err(Error::invalid(format!("host MAC {} is not a unicast address", mac)));
        }
        Ok(Self { mac, ips, location })
    }

    /// Stable identity of this host
    pub fn id(&self) -> HostId {
        HostId(self.mac)
    }

    /// IPv4 addresses of this host
    pub fn ipv4s(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ips.iter().filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    /// Whether the host owns the given address
    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip)
    }

    /// Whether the two hosts have at least one address in common
    pub fn shares_ip_with(&self, other: &Host) -> bool {
        self.ips.iter().any(|ip| other.ips.contains(ip))
    }
}

/// Catalog- or operator-assigned service identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(String);

impl ServiceId {
    /// Create a service identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier used for operator-registered services on an endpoint
    pub fn manual(ip: IpAddr, port: u16) -> Self {
        Self(format!("manual:{}:{}", ip, port))
    }

    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a service entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryTag {
    /// Registered by an operator
    Manual,
    /// Imported from the service catalog
    Catalog,
}

/// An addressable endpoint users may be granted access to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Stable identifier
    pub id: ServiceId,
    /// Host the service runs on
    pub host: Host,
    /// TCP port the service listens on
    pub port: u16,
    /// Human readable name
    pub name: String,
    /// Optional icon reference for portal front ends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Origin of the entry
    pub tag: DiscoveryTag,
}

impl Service {
    /// Create a new service
    pub fn new(
        id: ServiceId,
        host: Host,
        port: u16,
        name: impl Into<String>,
        tag: DiscoveryTag,
    ) -> Result<Self> {
        let name = name.into();
        if id.as_str().trim().is_empty() {
            return Err(Error::invalid("service id cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(Error::invalid("service name cannot be empty"));
        }
        if port == 0 {
            return Err(Error::invalid(format!("service {} has port 0", name)));
        }

        Ok(Self {
            id,
            host,
            port,
            name,
            icon: None,
            tag,
        })
    }

    /// Create an operator-registered service reachable at `ip:port`
    pub fn manual(name: impl Into<String>, host: Host, ip: IpAddr, port: u16) -> Result<Self> {
        if !host.has_ip(ip) {
            return Err(Error::invalid(format!(
                "host {} does not own address {}",
                host.mac, ip
            )));
        }
        Self::new(ServiceId::manual(ip, port), host, port, name, DiscoveryTag::Manual)
    }

    /// Attach an icon reference
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Whether this service listens on `ip:port`
    pub fn serves(&self, ip: IpAddr, port: u16) -> bool {
        self.port == port && self.host.has_ip(ip)
    }

    /// Whether this service was imported from the catalog
    pub fn is_catalog(&self) -> bool {
        self.tag == DiscoveryTag::Catalog
    }
}

/// Identity of a connection: one user paired with one service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// User host
    pub user: HostId,
    /// Service id
    pub service: ServiceId,
}

/// Granted access from one user host to one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// User side of the connection
    pub user: Host,
    /// Service side of the connection
    pub service: Service,
    /// Rules installed on behalf of this connection
    pub installed_rules: Vec<RuleHandle>,
    /// When access was granted
    pub granted_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection that has no rules installed yet
    pub fn new(user: Host, service: Service) -> Self {
        Self {
            user,
            service,
            installed_rules: Vec::new(),
            granted_at: Utc::now(),
        }
    }

    /// Identity of this connection
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            user: self.user.id(),
            service: self.service.id.clone(),
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Connection {}

/// The service unauthenticated traffic is steered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalDesignation {
    /// Portal address
    pub ip: IpAddr,
    /// Portal TCP port
    pub port: u16,
}

impl PortalDesignation {
    /// Create a portal designation
    pub fn new(ip: IpAddr, port: u16) -> Result<Self> {
        if port == 0 {
            return Err(Error::invalid("portal port cannot be 0"));
        }
        Ok(Self { ip, port })
    }
}

/// Per-service access flag for one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccess {
    /// The service
    pub service: Service,
    /// Whether the user holds a connection to it
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(last: u8) -> Host {
        Host::new(
            MacAddr::new(0, 0, 0, 0, 0, last),
            [IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))],
            ConnectPoint::new("of:1", last as u32),
        )
        .unwrap()
    }

    #[test]
    fn test_host_validation() {
        let location = ConnectPoint::new("of:1", 1);
        assert!(Host::new(MacAddr::new(0, 0, 0, 0, 0, 1), [], location.clone()).is_err());
        assert!(
            Host::new(
                MacAddr::zero(),
                ["10.0.0.1".parse().unwrap()],
                location.clone()
            )
            .is_err()
        );

        let dual = Host::new(
            MacAddr::new(0, 0, 0, 0, 0, 1),
            ["10.0.0.1".parse().unwrap(), "fe80::1".parse().unwrap()],
            location,
        )
        .unwrap();
        assert_eq!(dual.ipv4s().count(), 1);
        assert!(dual.has_ip("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_service_validation() {
        let h = host(4);
        assert!(Service::new(ServiceId::new(""), h.clone(), 22, "ssh", DiscoveryTag::Manual).is_err());
        assert!(Service::new(ServiceId::new("a"), h.clone(), 22, " ", DiscoveryTag::Manual).is_err());
        assert!(Service::new(ServiceId::new("a"), h.clone(), 0, "ssh", DiscoveryTag::Manual).is_err());
        assert!(Service::manual("ssh", h.clone(), "10.0.0.9".parse().unwrap(), 22).is_err());

        let ssh = Service::manual("ssh", h, "10.0.0.4".parse().unwrap(), 22).unwrap();
        assert_eq!(ssh.id.as_str(), "manual:10.0.0.4:22");
        assert!(ssh.serves("10.0.0.4".parse().unwrap(), 22));
        assert!(!ssh.serves("10.0.0.4".parse().unwrap(), 80));
        assert!(!ssh.is_catalog());
    }

    #[test]
    fn test_connection_identity_ignores_rules() {
        let ssh = Service::manual("ssh", host(4), "10.0.0.4".parse().unwrap(), 22).unwrap();
        let a = Connection::new(host(10), ssh.clone());
        let mut b = Connection::new(host(10), ssh);
        b.installed_rules.push(RuleHandle {
            id: crate::controller::rules::RuleId(7),
            device: DeviceId::new("of:1"),
            selector: Default::default(),
            priority: 40000,
        });
        assert_eq!(a, b);
        assert_eq!(a.key().user, HostId(MacAddr::new(0, 0, 0, 0, 0, 10)));
    }

    #[test]
    fn test_portal_designation() {
        assert!(PortalDesignation::new("10.0.0.1".parse().unwrap(), 0).is_err());
        assert!(PortalDesignation::new("10.0.0.1".parse().unwrap(), 80).is_ok());
    }
}
