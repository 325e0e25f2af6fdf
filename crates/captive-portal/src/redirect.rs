//! Captive portal redirection
//!
//! Packets that match no installed rule are punted to the controller and
//! classified here. Traffic from a host that has not been granted anything
//! yet is steered to the portal, either by rewriting each packet in the
//! controller or by installing short-lived rewrite rules on the ingress
//! device.

use crate::config::{PortalConfig, RedirectMode};
use crate::controller::rules::{
    AppId, DEFAULT_TABLE, ForwardingRule, RuleTimeout, TrafficSelector, TrafficTreatment,
};
use crate::controller::{HostDirectory, InboundPacket, PacketIo, RuleBackend, TopologyOracle};
use crate::error::{Error, Result};
use crate::models::{ConnectPoint, DeviceId, Host, PortNumber, Service};
use crate::network::egress_port;
use crate::store::ServiceStore;
use async_channel::Receiver;
use futures::lock::Mutex;
use indexmap::IndexMap;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rewritten flows remembered for the return path
const MAX_FLOW_MAPPINGS: usize = 4096;

/// Outcome of classifying one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Not a packet this engine handles
    Unclassified,
    /// Sent on through the flow table unchanged
    PassedThrough,
    /// Steered to the portal, or restored on its way back from it
    Redirected,
    /// Could not be steered; nothing was emitted
    Dropped,
}

/// Header fields the redirector looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    eth_src: MacAddr,
    eth_dst: MacAddr,
    ip_src: Ipv4Addr,
    ip_dst: Ipv4Addr,
    protocol: u8,
    src_port: Option<u16>,
    dst_port: Option<u16>,
}

impl Frame {
    fn parse(data: &[u8]) -> Option<Self> {
        let eth = EthernetPacket::new(data)?;
        if eth.get_ethertype() != EtherTypes::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new(eth.payload())?;
        let protocol = ip.get_next_level_protocol();
        let (src_port, dst_port) = match protocol {
            IpNextHeaderProtocols::Tcp => {
                TcpPacket::new(ip.payload()).map(|t| (t.get_source(), t.get_destination()))
            }
            IpNextHeaderProtocols::Udp => {
                UdpPacket::new(ip.payload()).map(|u| (u.get_source(), u.get_destination()))
            }
            _ => None,
        }
        .unzip();

        Some(Self {
            eth_src: eth.get_source(),
            eth_dst: eth.get_destination(),
            ip_src: ip.get_source(),
            ip_dst: ip.get_destination(),
            protocol: protocol.0,
            src_port,
            dst_port,
        })
    }

    /// DHCP, ARP-adjacent and multicast traffic must never be steered
    fn is_control(&self) -> bool {
        self.ip_src.is_unspecified()
            || self.ip_dst.is_broadcast()
            || self.ip_dst.is_multicast()
            || self.eth_dst.is_broadcast()
    }

    /// Return-path key when the client sent this frame
    fn client_key(&self) -> FlowKey {
        FlowKey {
            client: self.ip_src,
            client_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Return-path key when the portal sent this frame
    fn reply_key(&self) -> FlowKey {
        FlowKey {
            client: self.ip_dst,
            client_port: self.dst_port,
            protocol: self.protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    client: Ipv4Addr,
    client_port: Option<u16>,
    protocol: u8,
}

/// Where a client was heading before the rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OriginalDestination {
    mac: MacAddr,
    ip: Ipv4Addr,
}

/// Apply the header rewrites of `treatment` to a raw frame
///
/// IPv4 and TCP/UDP checksums are recomputed after any address change. A
/// UDP checksum of zero means "none" and is left alone.
pub fn apply_rewrite(treatment: &TrafficTreatment, data: &mut [u8]) -> Result<()> {
    let mut eth =
        MutableEthernetPacket::new(data).ok_or_else(|| Error::packet("truncated Ethernet frame"))?;
    if let Some(mac) = treatment.set_eth_src {
        eth.set_source(mac);
    }
    if let Some(mac) = treatment.set_eth_dst {
        eth.set_destination(mac);
    }
    if treatment.set_ip_src.is_none() && treatment.set_ip_dst.is_none() {
        return Ok(());
    }
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return Err(Error::packet("address rewrite on a non-IPv4 frame"));
    }

    let mut ip = MutableIpv4Packet::new(eth.payload_mut())
        .ok_or_else(|| Error::packet("truncated IPv4 header"))?;
    if let Some(addr) = treatment.set_ip_src {
        ip.set_source(addr);
    }
    if let Some(addr) = treatment.set_ip_dst {
        ip.set_destination(addr);
    }
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);

    let (src, dst) = (ip.get_source(), ip.get_destination());
    match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let mut segment = MutableTcpPacket::new(ip.payload_mut())
                .ok_or_else(|| Error::packet("truncated TCP header"))?;
            let checksum = tcp::ipv4_checksum(&segment.to_immutable(), &src, &dst);
            segment.set_checksum(checksum);
        }
        IpNextHeaderProtocols::Udp => {
            let mut datagram = MutableUdpPacket::new(ip.payload_mut())
                .ok_or_else(|| Error::packet("truncated UDP header"))?;
            if datagram.get_checksum() != 0 {
                let checksum = udp::ipv4_checksum(&datagram.to_immutable(), &src, &dst);
                datagram.set_checksum(checksum);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Classifies punted packets and steers unauthorized traffic to the portal
pub struct PortalRedirector {
    services: Arc<ServiceStore>,
    hosts: Arc<dyn HostDirectory>,
    topology: Arc<dyn TopologyOracle>,
    backend: Arc<dyn RuleBackend>,
    packets: Arc<dyn PacketIo>,
    mode: RedirectMode,
    app_id: AppId,
    priority: u16,
    idle_timeout: u16,
    mappings: Mutex<IndexMap<FlowKey, OriginalDestination>>,
}

impl PortalRedirector {
    /// Create a redirector
    pub fn new(
        services: Arc<ServiceStore>,
        hosts: Arc<dyn HostDirectory>,
        topology: Arc<dyn TopologyOracle>,
        backend: Arc<dyn RuleBackend>,
        packets: Arc<dyn PacketIo>,
        config: &PortalConfig,
    ) -> Self {
        Self {
            services,
            hosts,
            topology,
            backend,
            packets,
            mode: config.redirect_mode,
            app_id: config.app(),
            priority: config.redirect_priority,
            idle_timeout: config.redirect_timeout_secs,
            mappings: Mutex::new(IndexMap::new()),
        }
    }

    /// Redirect strategy in use
    pub fn mode(&self) -> RedirectMode {
        self.mode
    }

    /// Classify one punted packet and act on it
    pub async fn process(&self, packet: &InboundPacket) -> Classification {
        let Some(frame) = Frame::parse(&packet.data) else {
            return Classification::Unclassified;
        };
        if frame.is_control() {
            return Classification::Unclassified;
        }

        let Some(portal) = self.services.portal_service().await else {
            warn!(
                "No portal designated, leaving {} -> {} alone",
                frame.ip_src, frame.ip_dst
            );
            return Classification::Unclassified;
        };
        let Some(portal_ip) = portal.host.ipv4s().next() else {
            warn!("Portal {} has no IPv4 address", portal.name);
            return Classification::Unclassified;
        };

        if portal.host.has_ip(IpAddr::V4(frame.ip_src)) || frame.eth_src == portal.host.mac {
            return self.from_portal(packet, &frame).await;
        }

        let Some(user) = self.resolve_user(&frame) else {
            warn!(
                "{}",
                Error::ambiguous(format!(
                    "no single host for {} / {}",
                    frame.eth_src, frame.ip_src
                ))
            );
            return Classification::Dropped;
        };
        if self.services.connect(user, &portal.id).await {
            debug!("Granted {} access to the portal", frame.ip_src);
        }

        if portal.host.has_ip(IpAddr::V4(frame.ip_dst)) {
            return self.pass_through(packet);
        }

        match self.mode {
            RedirectMode::ControllerRewrite => {
                self.rewrite_to_portal(packet, &frame, &portal, portal_ip).await
            }
            RedirectMode::FlowRule => self.install_redirect(packet, &frame, &portal, portal_ip),
        }
    }

    /// Spawn `workers` tasks classifying packets from `packets`
    ///
    /// Each task ends once the channel closes. Dropping the returned tasks
    /// cancels them.
    pub fn spawn_workers(
        self: &Arc<Self>,
        packets: Receiver<InboundPacket>,
        workers: usize,
    ) -> Vec<smol::Task<()>> {
        (0..workers)
            .map(|worker| {
                let redirector = self.clone();
                let packets = packets.clone();
                smol::spawn(async move {
                    while let Ok(packet) = packets.recv().await {
                        let outcome = redirector.process(&packet).await;
                        debug!("Worker {} classified packet as {:?}", worker, outcome);
                    }
                })
            })
            .collect()
    }

    /// Number of remembered rewritten flows
    pub async fn mapping_count(&self) -> usize {
        self.mappings.lock().await.len()
    }

    async fn from_portal(&self, packet: &InboundPacket, frame: &Frame) -> Classification {
        if self.mode != RedirectMode::ControllerRewrite {
            return self.pass_through(packet);
        }
        let original = self.mappings.lock().await.get(&frame.reply_key()).copied();
        let Some(original) = original else {
            debug!(
                "Portal packet to {}:{:?} has no flow mapping, passing through",
                frame.ip_dst, frame.dst_port
            );
            return self.pass_through(packet);
        };

        let Some(client) = self.single_host_by_ip(IpAddr::V4(frame.ip_dst)) else {
            warn!("Portal reply to {} has no single client host", frame.ip_dst);
            return Classification::Dropped;
        };
        let port = match self.egress_toward(&packet.receiver, &client) {
            Ok(port) => port,
            Err(e) => {
                warn!("Portal reply to {} dropped: {}", frame.ip_dst, e);
                return Classification::Dropped;
            }
        };

        let rewrite = TrafficTreatment {
            set_eth_src: Some(original.mac),
            set_ip_src: Some(original.ip),
            ..TrafficTreatment::default()
        };
        self.emit_rewritten(&packet.receiver.device, &rewrite, &packet.data, port)
    }

    async fn rewrite_to_portal(
        &self,
        packet: &InboundPacket,
        frame: &Frame,
        portal: &Service,
        portal_ip: Ipv4Addr,
    ) -> Classification {
        let port = match self.egress_toward(&packet.receiver, &portal.host) {
            Ok(port) => port,
            Err(e) => {
                warn!("Redirect of {} to portal dropped: {}", frame.ip_src, e);
                return Classification::Dropped;
            }
        };

        let rewrite = TrafficTreatment {
            set_eth_dst: Some(portal.host.mac),
            set_ip_dst: Some(portal_ip),
            ..TrafficTreatment::default()
        };
        let outcome = self.emit_rewritten(&packet.receiver.device, &rewrite, &packet.data, port);
        if outcome == Classification::Redirected {
            let mut mappings = self.mappings.lock().await;
            mappings.insert(
                frame.client_key(),
                OriginalDestination {
                    mac: frame.eth_dst,
                    ip: frame.ip_dst,
                },
            );
            if mappings.len() > MAX_FLOW_MAPPINGS {
                mappings.shift_remove_index(0);
            }
            debug!(
                "Redirected {} -> {} to portal {}",
                frame.ip_src, frame.ip_dst, portal_ip
            );
        }
        outcome
    }

    fn install_redirect(
        &self,
        packet: &InboundPacket,
        frame: &Frame,
        portal: &Service,
        portal_ip: Ipv4Addr,
    ) -> Classification {
        let port = match self.egress_toward(&packet.receiver, &portal.host) {
            Ok(port) => port,
            Err(e) => {
                warn!("Redirect of {} to portal dropped: {}", frame.ip_src, e);
                return Classification::Dropped;
            }
        };

        let forward = ForwardingRule {
            app_id: self.app_id.clone(),
            device: packet.receiver.device.clone(),
            selector: TrafficSelector {
                in_port: Some(packet.receiver.port),
                ip_src: TrafficSelector::host_prefix(frame.ip_src),
                ip_dst: TrafficSelector::host_prefix(frame.ip_dst),
                ip_proto: Some(frame.protocol),
                tp_src: frame.src_port,
                tp_dst: frame.dst_port,
                ..TrafficSelector::ipv4()
            },
            treatment: TrafficTreatment {
                set_eth_dst: Some(portal.host.mac),
                set_ip_dst: Some(portal_ip),
                ..TrafficTreatment::output(port)
            },
            priority: self.priority,
            timeout: RuleTimeout::Idle(self.idle_timeout),
            table: DEFAULT_TABLE,
        };
        let reverse = ForwardingRule {
            selector: TrafficSelector {
                ip_src: TrafficSelector::host_prefix(portal_ip),
                ip_dst: TrafficSelector::host_prefix(frame.ip_src),
                ip_proto: Some(frame.protocol),
                tp_src: frame.dst_port,
                tp_dst: frame.src_port,
                ..TrafficSelector::ipv4()
            },
            treatment: TrafficTreatment {
                set_eth_src: Some(frame.eth_dst),
                set_ip_src: Some(frame.ip_dst),
                ..TrafficTreatment::output(packet.receiver.port)
            },
            ..forward.clone()
        };

        for rule in [forward, reverse] {
            if let Err(e) = self.backend.install(rule) {
                warn!("Redirect rule for {} refused: {}", frame.ip_src, e);
                return Classification::Dropped;
            }
        }
        info!(
            "Installed redirect {} -> {} via portal {} on {}",
            frame.ip_src, frame.ip_dst, portal_ip, packet.receiver.device
        );

        // the new rules pick the packet up from the table
        match self.packets.emit(
            &packet.receiver.device,
            TrafficTreatment::table(),
            packet.data.clone(),
        ) {
            Ok(()) => Classification::Redirected,
            Err(e) => {
                warn!("Failed to resubmit packet from {}: {}", frame.ip_src, e);
                Classification::Dropped
            }
        }
    }

    fn pass_through(&self, packet: &InboundPacket) -> Classification {
        match self.packets.emit(
            &packet.receiver.device,
            TrafficTreatment::table(),
            packet.data.clone(),
        ) {
            Ok(()) => Classification::PassedThrough,
            Err(e) => {
                warn!("Failed to pass packet through {}: {}", packet.receiver, e);
                Classification::Dropped
            }
        }
    }

    fn emit_rewritten(
        &self,
        device: &DeviceId,
        rewrite: &TrafficTreatment,
        data: &[u8],
        port: PortNumber,
    ) -> Classification {
        let mut data = data.to_vec();
        if let Err(e) = apply_rewrite(rewrite, &mut data) {
            warn!("Cannot rewrite packet: {}", e);
            return Classification::Dropped;
        }
        match self
            .packets
            .emit(device, TrafficTreatment::output(port), data)
        {
            Ok(()) => Classification::Redirected,
            Err(e) => {
                warn!("Failed to emit rewritten packet on {}: {}", device, e);
                Classification::Dropped
            }
        }
    }

    fn egress_toward(&self, receiver: &ConnectPoint, host: &Host) -> Result<PortNumber> {
        let location = self.services.connections().installer().locate(host)?;
        egress_port(self.topology.as_ref(), receiver, &location)
    }

    fn resolve_user(&self, frame: &Frame) -> Option<Host> {
        let mut by_mac = self.hosts.hosts_by_mac(frame.eth_src);
        if by_mac.len() == 1 {
            return by_mac.pop();
        }
        self.single_host_by_ip(IpAddr::V4(frame.ip_src))
    }

    fn single_host_by_ip(&self, ip: IpAddr) -> Option<Host> {
        let mut hosts = self.hosts.hosts_by_ip(ip);
        if hosts.len() == 1 { hosts.pop() } else { None }
    }
}
