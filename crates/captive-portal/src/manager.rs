//! Engine lifecycle and operator-facing operations
//!
//! [`PortalManager`] owns every component and is what front ends (CLI, REST)
//! talk to. Expected failures are logged and reported as `false`.

use crate::config::PortalConfig;
use crate::controller::rules::TrafficSelector;
use crate::controller::{DeviceDirectory, HostDirectory, PacketIo, RuleBackend, TopologyOracle};
use crate::discovery::{CatalogClient, CatalogSync, ConsulCatalog, Reconciler};
use crate::error::{Error, Result};
use crate::installer::RuleInstaller;
use crate::models::{
    Connection, DeviceId, Host, PortalDesignation, Service, ServiceAccess,
};
use crate::redirect::PortalRedirector;
use crate::store::{ConnectionStore, ServiceStore};
use futures::lock::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Priority of the request punting unmatched IPv4 traffic to the controller
pub const INTERCEPTION_PRIORITY: u16 = 5;

/// Name given to a portal service registered on the fly
const PORTAL_SERVICE_NAME: &str = "portal";

/// Controller services the engine runs against
#[derive(Clone)]
pub struct Collaborators {
    /// Device inventory
    pub devices: Arc<dyn DeviceDirectory>,
    /// Host directory and its events
    pub hosts: Arc<dyn HostDirectory>,
    /// Path computation
    pub topology: Arc<dyn TopologyOracle>,
    /// Rule installation
    pub backend: Arc<dyn RuleBackend>,
    /// Packet-in / packet-out
    pub packets: Arc<dyn PacketIo>,
}

/// The captive portal engine
pub struct PortalManager {
    config: PortalConfig,
    devices: Arc<dyn DeviceDirectory>,
    hosts: Arc<dyn HostDirectory>,
    packets: Arc<dyn PacketIo>,
    installer: Arc<RuleInstaller>,
    services: Arc<ServiceStore>,
    redirector: Arc<PortalRedirector>,
    catalog: CatalogSync,
    tasks: Mutex<Vec<smol::Task<()>>>,
}

impl PortalManager {
    /// Build the engine; nothing runs until [`start`](Self::start)
    pub fn new(config: PortalConfig, controller: Collaborators) -> Result<Self> {
        config.validate()?;

        let installer = Arc::new(RuleInstaller::new(
            controller.hosts.clone(),
            controller.topology.clone(),
            controller.backend.clone(),
            &config,
        ));
        let connections = Arc::new(ConnectionStore::new(installer.clone()));
        let services = Arc::new(ServiceStore::new(connections));
        let redirector = Arc::new(PortalRedirector::new(
            services.clone(),
            controller.hosts.clone(),
            controller.topology.clone(),
            controller.backend.clone(),
            controller.packets.clone(),
            &config,
        ));
        let catalog = CatalogSync::new(
            Reconciler::new(services.clone(), controller.hosts.clone()),
            config.catalog.clone(),
        );

        Ok(Self {
            config,
            devices: controller.devices,
            hosts: controller.hosts,
            packets: controller.packets,
            installer,
            services,
            redirector,
            catalog,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Service store
    pub fn service_store(&self) -> &Arc<ServiceStore> {
        &self.services
    }

    /// Connection store
    pub fn connection_store(&self) -> &Arc<ConnectionStore> {
        self.services.connections()
    }

    /// Packet redirector
    pub fn redirector(&self) -> &Arc<PortalRedirector> {
        &self.redirector
    }

    /// Subscribe to host events and packets and start classifying traffic
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Captive portal already started");
            return Ok(());
        }

        self.packets
            .request_interception(TrafficSelector::ipv4(), INTERCEPTION_PRIORITY)?;

        tasks.push(smol::spawn(self.services.clone().run(self.hosts.subscribe())));

        tasks.extend(
            self.redirector
                .spawn_workers(self.packets.subscribe(), self.config.packet_workers),
        );

        info!(
            "Captive portal started ({:?}, {} packet workers)",
            self.config.redirect_mode, self.config.packet_workers
        );
        Ok(())
    }

    /// Stop every task and remove every rule this engine placed
    pub async fn stop(&self) {
        let tasks: Vec<smol::Task<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.cancel().await;
        }
        self.catalog.disconnect().await;

        if let Err(e) = self.packets.cancel_interception(&TrafficSelector::ipv4()) {
            warn!("Failed to cancel packet interception: {}", e);
        }

        let connections = self.services.connections();
        for connection in connections.all().await {
            connections.remove(&connection.key()).await;
        }
        // redirect rules and partially installed connections
        if let Err(e) = self.installer.retract_all() {
            error!("Failed to retract rules of {}: {}", self.config.app_id, e);
        }
        info!("Captive portal stopped");
    }

    /// Designate the service at `ip:port` as the portal
    ///
    /// Registers a manual portal service when none listens there yet.
    /// Connections to a previously designated portal are removed and every
    /// known host is granted access to the new one.
    pub async fn set_portal(&self, ip: IpAddr, port: u16) -> bool {
        let designation = match PortalDesignation::new(ip, port) {
            Ok(d) => d,
            Err(e) => {
                warn!("Portal not set: {}", e);
                return false;
            }
        };

        let service = match self.services.by_endpoint(ip, port).await {
            Some(service) => service,
            None => {
                let Some(service) = self.manual_service(PORTAL_SERVICE_NAME, ip, port) else {
                    return false;
                };
                self.services.add(service.clone()).await;
                service
            }
        };

        if let Some(previous) = self.services.portal_service().await {
            if previous.id != service.id {
                let dropped = self
                    .services
                    .connections()
                    .remove_by_service(&previous.id)
                    .await;
                info!(
                    "Portal moved from {} to {}, dropped {} connections",
                    previous.id,
                    service.id,
                    dropped.len()
                );
            }
        }
        self.services.set_portal(Some(designation)).await;

        let mut granted = 0;
        for host in self.hosts.hosts() {
            if host.id() != service.host.id() && self.services.connect(host, &service.id).await {
                granted += 1;
            }
        }
        info!("Portal set to {}:{}, granted {} hosts", ip, port, granted);
        true
    }

    /// Current portal designation
    pub async fn portal(&self) -> Option<PortalDesignation> {
        self.services.portal().await
    }

    /// Every registered service
    pub async fn services(&self) -> Vec<Service> {
        self.services.all().await
    }

    /// Register a manual service on the host owning `ip`
    pub async fn add_service(&self, name: &str, ip: IpAddr, port: u16) -> bool {
        match self.manual_service(name, ip, port) {
            Some(service) => self.services.add(service).await,
            None => false,
        }
    }

    /// Remove the manual service listening on `ip:port`
    ///
    /// Catalog services can only change through the catalog.
    pub async fn remove_service(&self, ip: IpAddr, port: u16) -> bool {
        let Some(service) = self.services.by_endpoint(ip, port).await else {
            debug!("No service on {}:{}", ip, port);
            return false;
        };
        if service.is_catalog() {
            warn!("Service {} comes from the catalog, refusing removal", service.id);
            return false;
        }

        if self
            .services
            .portal()
            .await
            .is_some_and(|p| service.serves(p.ip, p.port))
        {
            self.services.set_portal(None).await;
            info!("Portal service {} removed, portal unset", service.id);
        }
        self.services.remove(&service).await
    }

    /// Every active connection
    pub async fn connections(&self) -> Vec<Connection> {
        self.services.connections().all().await
    }

    /// Grant the host owning `user_ip` access to the service on `service_ip:service_port`
    pub async fn grant(&self, user_ip: IpAddr, service_ip: IpAddr, service_port: u16) -> bool {
        let Some(service) = self.services.by_endpoint(service_ip, service_port).await else {
            warn!("No service on {}:{}", service_ip, service_port);
            return false;
        };
        let user = match self.single_host(user_ip) {
            Ok(user) => user,
            Err(e) => {
                warn!("Grant to {} refused: {}", user_ip, e);
                return false;
            }
        };
        self.services.connect(user, &service.id).await
    }

    /// Withdraw the access granted by [`grant`](Self::grant)
    pub async fn revoke(&self, user_ip: IpAddr, service_ip: IpAddr, service_port: u16) -> bool {
        let connections = self.services.connections();
        let Some(connection) = connections
            .by_user_ip(user_ip)
            .await
            .into_iter()
            .find(|c| c.service.serves(service_ip, service_port))
        else {
            debug!(
                "{} holds no connection to {}:{}",
                user_ip, service_ip, service_port
            );
            return false;
        };
        connections.remove(&connection.key()).await
    }

    /// Every service, flagged with whether `user_ip` may reach it
    pub async fn user_access(&self, user_ip: IpAddr) -> Vec<ServiceAccess> {
        let granted = self.services.connections().by_user_ip(user_ip).await;
        self.services
            .all()
            .await
            .into_iter()
            .map(|service| ServiceAccess {
                enabled: granted.iter().any(|c| c.service.id == service.id),
                service,
            })
            .collect()
    }

    /// Follow the Consul catalog at `addr`, replacing any previous catalog
    pub async fn connect_catalog(&self, addr: SocketAddr) -> Result<()> {
        info!("Connecting to service catalog at {}", addr);
        self.connect_catalog_client(Arc::new(ConsulCatalog::new(addr)?))
            .await;
        Ok(())
    }

    /// Follow an arbitrary catalog
    pub async fn connect_catalog_client(&self, client: Arc<dyn CatalogClient>) {
        self.catalog.connect(client).await;
    }

    /// Stop following the catalog; imported services stay registered
    pub async fn disconnect_catalog(&self) -> bool {
        self.catalog.disconnect().await
    }

    /// Devices known to the controller
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.devices()
    }

    fn single_host(&self, ip: IpAddr) -> Result<Host> {
        let mut hosts = self.hosts.hosts_by_ip(ip);
        match hosts.len() {
            1 => Ok(hosts.remove(0)),
            n => Err(Error::ambiguous(format!("{} hosts own {}", n, ip))),
        }
    }

    fn manual_service(&self, name: &str, ip: IpAddr, port: u16) -> Option<Service> {
        let host = match self.single_host(ip) {
            Ok(host) => host,
            Err(e) => {
                warn!("Service {} on {}:{} not registered: {}", name, ip, port, e);
                return None;
            }
        };
        match Service::manual(name, host, ip, port) {
            Ok(service) => Some(service),
            Err(e) => {
                warn!("Service {} on {}:{} not registered: {}", name, ip, port, e);
                None
            }
        }
    }
}
