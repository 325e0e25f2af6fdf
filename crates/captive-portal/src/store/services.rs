//! Registered services and the portal designation

use super::ConnectionStore;
use crate::controller::{HostEvent, HostEventKind};
use crate::models::{Connection, DiscoveryTag, Host, PortalDesignation, Service, ServiceId};
use async_channel::Receiver;
use futures::lock::Mutex;
use indexmap::IndexMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of service endpoints
///
/// Removing a service removes every connection to it while the service lock
/// is held, so no connection outlives its service.
pub struct ServiceStore {
    connections: Arc<ConnectionStore>,
    services: Mutex<IndexMap<ServiceId, Service>>,
    portal: Mutex<Option<PortalDesignation>>,
}

impl ServiceStore {
    /// Create an empty store cascading removals into `connections`
    pub fn new(connections: Arc<ConnectionStore>) -> Self {
        Self {
            connections,
            services: Mutex::new(IndexMap::new()),
            portal: Mutex::new(None),
        }
    }

    /// Connection store removals cascade into
    pub fn connections(&self) -> &Arc<ConnectionStore> {
        &self.connections
    }

    /// Register a service
    ///
    /// Returns false if an equal service is already present, or if another
    /// service holds the same id.
    pub async fn add(&self, service: Service) -> bool {
        let mut services = self.services.lock().await;
        match services.get(&service.id) {
            Some(existing) if existing == &service => {
                debug!("Service {} already registered", service.id);
                false
            }
            Some(_) => {
                warn!(
                    "Service id {} already registered with different attributes",
                    service.id
                );
                false
            }
            None => {
                info!(
                    "Registering service {} ({}) on port {}",
                    service.name, service.id, service.port
                );
                services.insert(service.id.clone(), service);
                true
            }
        }
    }

    /// Remove a service and every connection to it
    pub async fn remove(&self, service: &Service) -> bool {
        self.remove_by_id(&service.id).await.is_some()
    }

    /// Remove the service with the given id and every connection to it
    pub async fn remove_by_id(&self, id: &ServiceId) -> Option<Service> {
        let mut services = self.services.lock().await;
        if !services.contains_key(id) {
            return None;
        }

        let dropped = self.connections.remove_by_service(id).await;
        let service = services.shift_remove(id)?;
        info!(
            "Removed service {} ({}) and {} connections",
            service.name,
            id,
            dropped.len()
        );
        Some(service)
    }

    /// Grant `user` access to the service with the given id
    ///
    /// The service lock is held across the installation so the service cannot
    /// disappear underneath the new connection.
    pub async fn connect(&self, user: Host, id: &ServiceId) -> bool {
        let services = self.services.lock().await;
        let Some(service) = services.get(id) else {
            warn!("Cannot connect {} to unknown service {}", user.mac, id);
            return false;
        };
        self.connections
            .add(Connection::new(user, service.clone()))
            .await
    }

    /// Look up by id
    pub async fn get(&self, id: &ServiceId) -> Option<Service> {
        self.services.lock().await.get(id).cloned()
    }

    /// Services hosted on `ip`
    pub async fn by_ip(&self, ip: IpAddr) -> Vec<Service> {
        self.filter(|s| s.host.has_ip(ip)).await
    }

    /// Services listening on `port`
    pub async fn by_port(&self, port: u16) -> Vec<Service> {
        self.filter(|s| s.port == port).await
    }

    /// Services with the given name
    pub async fn by_name(&self, name: &str) -> Vec<Service> {
        self.filter(|s| s.name == name).await
    }

    /// The service listening on `ip:port`, if any
    pub async fn by_endpoint(&self, ip: IpAddr, port: u16) -> Option<Service> {
        self.filter(|s| s.serves(ip, port)).await.into_iter().next()
    }

    /// Services with the given origin
    pub async fn by_tag(&self, tag: DiscoveryTag) -> Vec<Service> {
        self.filter(|s| s.tag == tag).await
    }

    /// All services
    pub async fn all(&self) -> Vec<Service> {
        self.services.lock().await.values().cloned().collect()
    }

    /// Whether an equal service is registered
    pub async fn contains(&self, service: &Service) -> bool {
        self.services.lock().await.get(&service.id) == Some(service)
    }

    /// Number of registered services
    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    /// True when no service is registered
    pub async fn is_empty(&self) -> bool {
        self.services.lock().await.is_empty()
    }

    /// Replace the portal designation, returning the previous one
    pub async fn set_portal(&self, portal: Option<PortalDesignation>) -> Option<PortalDesignation> {
        std::mem::replace(&mut *self.portal.lock().await, portal)
    }

    /// Current portal designation
    pub async fn portal(&self) -> Option<PortalDesignation> {
        *self.portal.lock().await
    }

    /// The service the portal designation points at
    pub async fn portal_service(&self) -> Option<Service> {
        let portal = self.portal().await?;
        self.by_endpoint(portal.ip, portal.port).await
    }

    /// React to one host lifecycle event
    ///
    /// Connections follow the host first. A newly added host is then granted
    /// the portal, unless it is the portal host itself.
    pub async fn handle_host_event(&self, event: &HostEvent) {
        self.connections.handle_host_event(event).await;

        if event.kind != HostEventKind::Added {
            return;
        }
        let Some(portal) = self.portal_service().await else {
            return;
        };
        if portal.host.id() != event.subject.id()
            && self.connect(event.subject.clone(), &portal.id).await
        {
            debug!("New host {} granted the portal", event.subject.mac);
        }
    }

    /// Consume host events until the channel closes
    pub async fn run(self: Arc<Self>, events: Receiver<HostEvent>) {
        while let Ok(event) = events.recv().await {
            self.handle_host_event(&event).await;
        }
        debug!("Host event channel closed");
    }

    async fn filter(&self, predicate: impl Fn(&Service) -> bool) -> Vec<Service> {
        self.services
            .lock()
            .await
            .values()
            .filter(|s| predicate(s))
            .cloned()
            .collect()
    }
}
