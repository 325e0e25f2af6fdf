//! Connection rule installation
//!
//! Turns one user/service pairing into forwarding state: both endpoints are
//! located through the host directory, a path between their devices is
//! chosen, and every device on that path receives one hop pair per IPv4
//! address pair. A hop pair is a user-to-service rule and a
//! service-to-user rule.

use crate::config::PortalConfig;
use crate::controller::rules::{
    AppId, DEFAULT_TABLE, ForwardingRule, IP_PROTO_TCP, RuleTimeout, TrafficSelector,
    TrafficTreatment,
};
use crate::controller::{HostDirectory, RuleBackend, TopologyOracle};
use crate::error::{Error, Result};
use crate::models::{ConnectPoint, Connection, DeviceId, Host, PortNumber};
use crate::network::select_path;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One device's share of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hop {
    device: DeviceId,
    /// Port facing the user
    user_port: PortNumber,
    /// Port facing the service
    service_port: PortNumber,
}

/// Installs and retracts the rules that realize connections
pub struct RuleInstaller {
    hosts: Arc<dyn HostDirectory>,
    topology: Arc<dyn TopologyOracle>,
    backend: Arc<dyn RuleBackend>,
    app_id: AppId,
    priority: u16,
    match_eth_dst: bool,
}

impl RuleInstaller {
    /// Create an installer
    pub fn new(
        hosts: Arc<dyn HostDirectory>,
        topology: Arc<dyn TopologyOracle>,
        backend: Arc<dyn RuleBackend>,
        config: &PortalConfig,
    ) -> Self {
        Self {
            hosts,
            topology,
            backend,
            app_id: config.app(),
            priority: config.connection_priority,
            match_eth_dst: config.match_eth_dst,
        }
    }

    /// Current attachment point of a host, as the directory reports it now
    pub fn locate(&self, host: &Host) -> Result<ConnectPoint> {
        let mut found = self.hosts.hosts_by_mac(host.mac);
        match found.len() {
            1 => Ok(found.remove(0).location),
            n => Err(Error::ambiguous(format!(
                "{} directory entries for host {}",
                n, host.mac
            ))),
        }
    }

    /// Program every device between the connection's user and service
    ///
    /// Handles are appended to `connection.installed_rules` as each rule is
    /// accepted. A failure part-way leaves the rules already submitted in
    /// place; they are listed in the connection but nothing retracts them.
    pub fn install(&self, connection: &mut Connection) -> Result<()> {
        let user = &connection.user;
        let service = &connection.service;

        let pairs: Vec<(Ipv4Addr, Ipv4Addr)> = user
            .ipv4s()
            .flat_map(|u| service.host.ipv4s().map(move |s| (u, s)))
            .collect();
        if pairs.is_empty() {
            return Err(Error::ambiguous(format!(
                "no IPv4 address pair between {} and service {}",
                user.mac, service.name
            )));
        }

        let user_location = self.locate(user)?;
        let service_location = self.locate(&service.host)?;
        let hops = self.hops(&user_location, &service_location)?;

        let mut rules = Vec::with_capacity(hops.len() * pairs.len() * 2);
        for hop in &hops {
            for &(user_ip, service_ip) in &pairs {
                rules.push(self.outbound_rule(hop, connection, user_ip, service_ip));
                rules.push(self.return_rule(hop, connection, user_ip, service_ip));
            }
        }

        for rule in rules {
            debug!(
                "Installing rule on {} (in_port {:?})",
                rule.device, rule.selector.in_port
            );
            match self.backend.install(rule) {
                Ok(handle) => connection.installed_rules.push(handle),
                Err(e) => {
                    warn!(
                        "Rule installation for {} -> {} failed after {} rules: {}",
                        connection.user.mac,
                        connection.service.name,
                        connection.installed_rules.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }

        info!(
            "Installed {} rules over {} devices for {} -> {}",
            connection.installed_rules.len(),
            hops.len(),
            connection.user.mac,
            connection.service.name
        );
        Ok(())
    }

    /// Retract every rule the connection holds
    pub fn retract(&self, connection: &Connection) {
        for handle in &connection.installed_rules {
            if let Err(e) = self.backend.retract(handle) {
                warn!("Failed to retract rule {:?} on {}: {}", handle.id, handle.device, e);
            }
        }
        debug!(
            "Retracted {} rules for {} -> {}",
            connection.installed_rules.len(),
            connection.user.mac,
            connection.service.name
        );
    }

    /// Retract every rule this application owns
    pub fn retract_all(&self) -> Result<()> {
        self.backend.retract_all_by_app(&self.app_id)
    }

    /// Devices to program, from the user's edge to the service's edge
    fn hops(&self, user: &ConnectPoint, service: &ConnectPoint) -> Result<Vec<Hop>> {
        if user.device == service.device {
            return Ok(vec![Hop {
                device: user.device.clone(),
                user_port: user.port,
                service_port: service.port,
            }]);
        }

        let paths = self.topology.paths(&user.device, &service.device);
        let Some(path) = select_path(&paths, user.port) else {
            let e = Error::NoPathFound {
                from: user.device.clone(),
                to: service.device.clone(),
            };
            warn!("{}", e);
            return Err(e);
        };

        let mut hops = Vec::with_capacity(path.len() + 1);
        let mut ingress = user.port;
        for link in &path.links {
            hops.push(Hop {
                device: link.src.device.clone(),
                user_port: ingress,
                service_port: link.src.port,
            });
            ingress = link.dst.port;
        }
        hops.push(Hop {
            device: service.device.clone(),
            user_port: ingress,
            service_port: service.port,
        });
        Ok(hops)
    }

    fn outbound_rule(
        &self,
        hop: &Hop,
        connection: &Connection,
        user_ip: Ipv4Addr,
        service_ip: Ipv4Addr,
    ) -> ForwardingRule {
        let selector = TrafficSelector {
            in_port: Some(hop.user_port),
            eth_src: Some(connection.user.mac),
            ip_src: TrafficSelector::host_prefix(user_ip),
            ip_dst: TrafficSelector::host_prefix(service_ip),
            ip_proto: Some(IP_PROTO_TCP),
            tp_dst: Some(connection.service.port),
            ..TrafficSelector::ipv4()
        };
        self.rule(hop, selector, hop.service_port)
    }

    fn return_rule(
        &self,
        hop: &Hop,
        connection: &Connection,
        user_ip: Ipv4Addr,
        service_ip: Ipv4Addr,
    ) -> ForwardingRule {
        let selector = TrafficSelector {
            in_port: Some(hop.service_port),
            eth_dst: self.match_eth_dst.then_some(connection.user.mac),
            ip_src: TrafficSelector::host_prefix(service_ip),
            ip_dst: TrafficSelector::host_prefix(user_ip),
            ..TrafficSelector::ipv4()
        };
        self.rule(hop, selector, hop.user_port)
    }

    fn rule(&self, hop: &Hop, selector: TrafficSelector, out: PortNumber) -> ForwardingRule {
        ForwardingRule {
            app_id: self.app_id.clone(),
            device: hop.device.clone(),
            selector,
            treatment: TrafficTreatment::output(out),
            priority: self.priority,
            timeout: RuleTimeout::Permanent,
            table: DEFAULT_TABLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{MemoryHostDirectory, MemoryRuleBackend};
    use crate::models::{Service, ServiceId, DiscoveryTag};
    use crate::network::GraphTopology;
    use pnet::util::MacAddr;
    use std::net::IpAddr;

    struct Fixture {
        hosts: Arc<MemoryHostDirectory>,
        topology: Arc<GraphTopology>,
        backend: Arc<MemoryRuleBackend>,
        installer: RuleInstaller,
    }

    fn fixture(config: PortalConfig) -> Fixture {
        let hosts = Arc::new(MemoryHostDirectory::new());
        let topology = Arc::new(GraphTopology::new());
        let backend = Arc::new(MemoryRuleBackend::new());
        let installer = RuleInstaller::new(
            hosts.clone(),
            topology.clone(),
            backend.clone(),
            &config,
        );
        Fixture {
            hosts,
            topology,
            backend,
            installer,
        }
    }

    fn host(last: u8, ips: &[&str], device: &str, port: u32) -> Host {
        Host::new(
            MacAddr::new(0, 0, 0, 0, 0, last),
            ips.iter().map(|ip| ip.parse::<IpAddr>().unwrap()),
            ConnectPoint::new(device, port),
        )
        .unwrap()
    }

    fn service(host: Host, port: u16) -> Service {
        Service::new(ServiceId::new("svc"), host, port, "svc", DiscoveryTag::Manual).unwrap()
    }

    #[test]
    fn test_same_device_single_hop_pair() {
        let f = fixture(PortalConfig::default());
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:1", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 22));
        f.installer.install(&mut connection).unwrap();

        let rules = f.backend.rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(connection.installed_rules.len(), 2);

        let outbound = &rules[0];
        assert_eq!(outbound.selector.in_port, Some(1));
        assert_eq!(outbound.selector.tp_dst, Some(22));
        assert_eq!(outbound.selector.ip_proto, Some(IP_PROTO_TCP));
        assert_eq!(outbound.treatment, TrafficTreatment::output(2));
        assert_eq!(outbound.timeout, RuleTimeout::Permanent);

        let back = &rules[1];
        assert_eq!(back.selector.in_port, Some(2));
        assert_eq!(back.selector.eth_dst, None);
        assert_eq!(back.treatment, TrafficTreatment::output(1));
    }

    #[test]
    fn test_match_eth_dst_switch() {
        let f = fixture(PortalConfig {
            match_eth_dst: true,
            ..PortalConfig::default()
        });
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:1", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user.clone(), service(server, 22));
        f.installer.install(&mut connection).unwrap();
        assert_eq!(f.backend.rules()[1].selector.eth_dst, Some(user.mac));
    }

    #[test]
    fn test_multi_hop_ports() {
        let f = fixture(PortalConfig::default());
        f.topology
            .add_bidirectional_link(ConnectPoint::new("of:1", 10), ConnectPoint::new("of:2", 20));
        f.topology
            .add_bidirectional_link(ConnectPoint::new("of:2", 21), ConnectPoint::new("of:3", 30));
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:3", 3);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 80));
        f.installer.install(&mut connection).unwrap();
        assert_eq!(f.backend.len(), 6);

        let middle = f.backend.rules_on(&DeviceId::new("of:2"));
        assert_eq!(middle.len(), 2);
        assert_eq!(middle[0].selector.in_port, Some(20));
        assert_eq!(middle[0].treatment, TrafficTreatment::output(21));
        assert_eq!(middle[1].selector.in_port, Some(21));
        assert_eq!(middle[1].treatment, TrafficTreatment::output(20));

        let edge = f.backend.rules_on(&DeviceId::new("of:3"));
        assert_eq!(edge[0].selector.in_port, Some(30));
        assert_eq!(edge[0].treatment, TrafficTreatment::output(3));
    }

    #[test]
    fn test_address_pairs_skip_ipv6() {
        let f = fixture(PortalConfig::default());
        let user = host(10, &["10.0.0.10", "10.0.1.10", "fe80::10"], "of:1", 1);
        let server = host(4, &["10.0.0.4", "fe80::4"], "of:1", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 22));
        f.installer.install(&mut connection).unwrap();
        // two IPv4 pairs on one device
        assert_eq!(f.backend.len(), 4);
    }

    #[test]
    fn test_ipv6_only_rejected() {
        let f = fixture(PortalConfig::default());
        let user = host(10, &["fe80::10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:1", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 22));
        assert!(matches!(
            f.installer.install(&mut connection),
            Err(Error::AmbiguousResolution(_))
        ));
        assert!(f.backend.is_empty());
    }

    #[test]
    fn test_no_path() {
        let f = fixture(PortalConfig::default());
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:2", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 22));
        assert!(matches!(
            f.installer.install(&mut connection),
            Err(Error::NoPathFound { .. })
        ));
        assert!(connection.installed_rules.is_empty());
        assert!(f.backend.is_empty());
    }

    #[test]
    fn test_unknown_host() {
        let f = fixture(PortalConfig::default());
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:1", 2);
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 22));
        assert!(matches!(
            f.installer.install(&mut connection),
            Err(Error::AmbiguousResolution(_))
        ));
    }

    #[test]
    fn test_partial_failure_keeps_installed_hops() {
        let f = fixture(PortalConfig::default());
        f.topology
            .add_bidirectional_link(ConnectPoint::new("of:1", 10), ConnectPoint::new("of:2", 20));
        f.backend.reject_device(DeviceId::new("of:2"));
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:2", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());

        let mut connection = Connection::new(user, service(server, 22));
        assert!(f.installer.install(&mut connection).is_err());
        assert_eq!(connection.installed_rules.len(), 2);
        assert_eq!(f.backend.len(), 2);

        f.installer.retract(&connection);
        assert!(f.backend.is_empty());
    }

    #[test]
    fn test_resolves_current_location() {
        let f = fixture(PortalConfig::default());
        let user = host(10, &["10.0.0.10"], "of:1", 1);
        let server = host(4, &["10.0.0.4"], "of:1", 2);
        f.hosts.add_host(user.clone());
        f.hosts.add_host(server.clone());
        f.hosts.move_host(user.mac, ConnectPoint::new("of:1", 5));

        // stale snapshot, fresh location
        let mut connection = Connection::new(user, service(server, 22));
        f.installer.install(&mut connection).unwrap();
        assert_eq!(f.backend.rules()[0].selector.in_port, Some(5));
    }
}
