//! Active user/service connections

use crate::controller::{HostEvent, HostEventKind};
use crate::installer::RuleInstaller;
use crate::models::{Connection, ConnectionKey, Host, ServiceId};
use futures::lock::Mutex;
use indexmap::IndexMap;
use pnet::util::MacAddr;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of active connections
///
/// At most one connection per (user, service) pair is recorded, and a pair is
/// only recorded once its rules were installed. Mutations and host-event
/// handling are serialized behind one lock.
pub struct ConnectionStore {
    installer: Arc<RuleInstaller>,
    connections: Mutex<IndexMap<ConnectionKey, Connection>>,
}

impl ConnectionStore {
    /// Create an empty store installing rules through `installer`
    pub fn new(installer: Arc<RuleInstaller>) -> Self {
        Self {
            installer,
            connections: Mutex::new(IndexMap::new()),
        }
    }

    /// Installer used by this store
    pub fn installer(&self) -> &Arc<RuleInstaller> {
        &self.installer
    }

    /// Install and record a connection
    ///
    /// Returns false when the pair is already active or installation failed.
    pub async fn add(&self, connection: Connection) -> bool {
        let mut connections = self.connections.lock().await;
        self.add_locked(&mut connections, connection)
    }

    /// Forget a connection and retract its rules
    pub async fn remove(&self, key: &ConnectionKey) -> bool {
        let mut connections = self.connections.lock().await;
        self.remove_locked(&mut connections, key).is_some()
    }

    /// Remove every connection to `service`, returning them
    pub async fn remove_by_service(&self, service: &ServiceId) -> Vec<Connection> {
        let mut connections = self.connections.lock().await;
        let keys: Vec<ConnectionKey> = connections
            .keys()
            .filter(|k| &k.service == service)
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|key| self.remove_locked(&mut connections, key))
            .collect()
    }

    /// Hosts currently connected to `service`
    pub async fn users_of(&self, service: &ServiceId) -> Vec<Host> {
        self.filter(|c| &c.service.id == service)
            .await
            .into_iter()
            .map(|c| c.user)
            .collect()
    }

    /// All connections
    pub async fn all(&self) -> Vec<Connection> {
        self.connections.lock().await.values().cloned().collect()
    }

    /// Connections of the user owning `ip`
    pub async fn by_user_ip(&self, ip: IpAddr) -> Vec<Connection> {
        self.filter(|c| c.user.has_ip(ip)).await
    }

    /// Connections of the user with both `ip` and `mac`
    pub async fn by_user(&self, ip: IpAddr, mac: MacAddr) -> Vec<Connection> {
        self.filter(|c| c.user.mac == mac && c.user.has_ip(ip)).await
    }

    /// Connections to the service listening on `ip:port`
    pub async fn by_service_endpoint(&self, ip: IpAddr, port: u16) -> Vec<Connection> {
        self.filter(|c| c.service.serves(ip, port)).await
    }

    /// Connections to one service
    pub async fn by_service(&self, service: &ServiceId) -> Vec<Connection> {
        self.filter(|c| &c.service.id == service).await
    }

    /// Look up a single pair
    pub async fn get(&self, key: &ConnectionKey) -> Option<Connection> {
        self.connections.lock().await.get(key).cloned()
    }

    /// Whether a pair is active
    pub async fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.lock().await.contains_key(key)
    }

    /// Number of active connections
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// True when no connection is active
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// React to one host lifecycle event
    ///
    /// Removals drop the host's connections. Moves and updates re-route them:
    /// each affected connection is removed and added again so rules follow the
    /// new attachment point. Additions are ignored here.
    pub async fn handle_host_event(&self, event: &HostEvent) {
        let host = &event.subject;
        let mut connections = self.connections.lock().await;

        match event.kind {
            HostEventKind::Added => {}
            HostEventKind::Removed => {
                let keys: Vec<ConnectionKey> = connections
                    .values()
                    .filter(|c| Self::is_user(c, event))
                    .map(Connection::key)
                    .collect();
                for key in &keys {
                    self.remove_locked(&mut connections, key);
                }
                if !keys.is_empty() {
                    info!("Host {} removed, dropped {} connections", host.mac, keys.len());
                }
            }
            HostEventKind::Moved | HostEventKind::Updated => {
                let affected: Vec<Connection> = connections
                    .values()
                    .filter(|c| {
                        Self::is_user(c, event)
                            || (event.kind == HostEventKind::Moved && c.service.host.id() == host.id())
                    })
                    .cloned()
                    .collect();

                for old in affected {
                    self.remove_locked(&mut connections, &old.key());
                    let user = if Self::is_user(&old, event) {
                        host.clone()
                    } else {
                        old.user
                    };
                    if !self.add_locked(&mut connections, Connection::new(user, old.service)) {
                        warn!("Re-route after {:?} of host {} failed", event.kind, host.mac);
                    }
                }
            }
        }
    }

    fn is_user(connection: &Connection, event: &HostEvent) -> bool {
        let user = &connection.user;
        user.id() == event.subject.id()
            || user.shares_ip_with(&event.subject)
            || event
                .previous
                .as_ref()
                .is_some_and(|prev| user.shares_ip_with(prev))
    }

    fn add_locked(
        &self,
        connections: &mut IndexMap<ConnectionKey, Connection>,
        mut connection: Connection,
    ) -> bool {
        let key = connection.key();
        if connections.contains_key(&key) {
            debug!(
                "Connection {} -> {} already active",
                connection.user.mac, connection.service.name
            );
            return false;
        }

        match self.installer.install(&mut connection) {
            Ok(()) => {
                info!(
                    "Connection {} -> {} active",
                    connection.user.mac, connection.service.name
                );
                connections.insert(key, connection);
                true
            }
            Err(e) => {
                warn!(
                    "Connection {} -> {} not added: {}",
                    connection.user.mac, connection.service.name, e
                );
                false
            }
        }
    }

    /// Drop from the map first, then retract
    fn remove_locked(
        &self,
        connections: &mut IndexMap<ConnectionKey, Connection>,
        key: &ConnectionKey,
    ) -> Option<Connection> {
        let connection = connections.shift_remove(key)?;
        self.installer.retract(&connection);
        info!(
            "Connection {} -> {} removed",
            connection.user.mac, connection.service.name
        );
        Some(connection)
    }

    async fn filter(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Connection> {
        self.connections
            .lock()
            .await
            .values()
            .filter(|c| predicate(c))
            .cloned()
            .collect()
    }
}
