//! Shared fixtures for captive portal integration tests

#![allow(dead_code)]

use captive_portal::prelude::*;
use pnet::packet::MutablePacket;
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket};
use pnet::util::MacAddr;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for waiting on background tasks
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine wired to in-memory collaborators
pub struct TestNetwork {
    pub topology: Arc<GraphTopology>,
    pub hosts: Arc<MemoryHostDirectory>,
    pub backend: Arc<MemoryRuleBackend>,
    pub packets: Arc<MemoryPacketIo>,
    pub manager: PortalManager,
}

impl TestNetwork {
    /// Engine with the default configuration
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(PortalConfig::default())
    }

    /// Engine with a custom configuration
    pub fn with_config(config: PortalConfig) -> anyhow::Result<Self> {
        init_tracing();
        let topology = Arc::new(GraphTopology::new());
        let hosts = Arc::new(MemoryHostDirectory::new());
        let backend = Arc::new(MemoryRuleBackend::new());
        let packets = Arc::new(MemoryPacketIo::new());

        let manager = PortalManager::new(
            config,
            Collaborators {
                devices: topology.clone(),
                hosts: hosts.clone(),
                topology: topology.clone(),
                backend: backend.clone(),
                packets: packets.clone(),
            },
        )?;

        Ok(Self {
            topology,
            hosts,
            backend,
            packets,
            manager,
        })
    }

    /// Chain `count` devices `of:1 .. of:count`; port 100 leads right, 200 left
    pub fn linear(self, count: usize) -> Self {
        for i in 1..=count {
            self.topology.add_device(device(i));
        }
        for i in 1..count {
            self.topology.add_bidirectional_link(
                ConnectPoint::new(device(i), 100),
                ConnectPoint::new(device(i + 1), 200),
            );
        }
        self
    }

    /// Attach a host `10.0.0.<last>` to `device:port`
    pub fn attach(&self, last: u8, device: &str, port: PortNumber) -> Host {
        let host = host(last, device, port);
        self.hosts.add_host(host.clone());
        host
    }

    /// Wait until `check` holds or the test timeout expires
    pub async fn wait_for<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = std::time::Instant::now() + TEST_TIMEOUT;
        while std::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            smol::Timer::after(Duration::from_millis(10)).await;
        }
        false
    }
}

/// Device id `of:<i>`
pub fn device(i: usize) -> String {
    format!("of:{}", i)
}

/// MAC `00:00:00:00:00:<last>`
pub fn mac(last: u8) -> MacAddr {
    MacAddr::new(0, 0, 0, 0, 0, last)
}

/// Address `10.0.0.<last>`
pub fn ip(last: u8) -> IpAddr {
    IpAddr::V4(v4(last))
}

/// IPv4 address `10.0.0.<last>`
pub fn v4(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

/// Host `10.0.0.<last>` with MAC `..:<last>` at `device:port`
pub fn host(last: u8, device: &str, port: PortNumber) -> Host {
    Host::new(mac(last), [ip(last)], ConnectPoint::new(device, port))
        .unwrap_or_else(|e| panic!("bad test host: {}", e))
}

/// Ethernet/IPv4/TCP frame with valid checksums
pub fn tcp_frame(
    eth: (MacAddr, MacAddr),
    addrs: (Ipv4Addr, Ipv4Addr),
    ports: (u16, u16),
) -> Vec<u8> {
    let mut data = vec![0u8; 14 + 20 + 20];
    let mut frame = MutableEthernetPacket::new(&mut data).unwrap();
    frame.set_source(eth.0);
    frame.set_destination(eth.1);
    frame.set_ethertype(EtherTypes::Ipv4);

    let mut packet = MutableIpv4Packet::new(frame.payload_mut()).unwrap();
    packet.set_version(4);
    packet.set_header_length(5);
    packet.set_total_length(40);
    packet.set_ttl(64);
    packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
    packet.set_source(addrs.0);
    packet.set_destination(addrs.1);
    let checksum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(checksum);

    let mut segment = MutableTcpPacket::new(packet.payload_mut()).unwrap();
    segment.set_source(ports.0);
    segment.set_destination(ports.1);
    segment.set_data_offset(5);
    let checksum = tcp::ipv4_checksum(&segment.to_immutable(), &addrs.0, &addrs.1);
    segment.set_checksum(checksum);

    data
}

/// Install a log subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
