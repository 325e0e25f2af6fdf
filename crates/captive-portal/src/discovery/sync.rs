//! Catalog-to-store synchronization

use super::catalog::{CatalogClient, CatalogEntry};
use crate::config::CatalogConfig;
use crate::controller::HostDirectory;
use crate::error::Error;
use crate::models::{DiscoveryTag, Service, ServiceId};
use crate::store::ServiceStore;
use futures::lock::Mutex;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// New catalog services registered
    pub added: usize,
    /// Local catalog services removed
    pub removed: usize,
    /// Services replaced because their attributes changed
    pub updated: usize,
    /// Services already in sync
    pub unchanged: usize,
    /// Ids reported more than once
    pub conflicts: usize,
    /// Entries whose address matched no single host
    pub skipped: usize,
}

/// Applies catalog listings to the service store
#[derive(Clone)]
pub struct Reconciler {
    services: Arc<ServiceStore>,
    hosts: Arc<dyn HostDirectory>,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(services: Arc<ServiceStore>, hosts: Arc<dyn HostDirectory>) -> Self {
        Self { services, hosts }
    }

    /// Make the catalog-tagged services match `entries`
    ///
    /// Operator-registered services are never touched. An id listed more
    /// than once is treated as absent. Entries whose address resolves to
    /// zero or several hosts are treated as absent too.
    pub async fn reconcile(&self, entries: &[CatalogEntry]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut grouped: IndexMap<&str, Vec<&CatalogEntry>> = IndexMap::new();
        for entry in entries {
            grouped.entry(entry.id.as_str()).or_default().push(entry);
        }

        let mut desired: IndexMap<ServiceId, Service> = IndexMap::new();
        for (id, group) in grouped {
            if group.len() > 1 {
                let e = Error::CatalogConflict(format!(
                    "service id {} listed {} times",
                    id,
                    group.len()
                ));
                warn!("{}", e);
                report.conflicts += 1;
                continue;
            }
            match self.resolve(group[0]) {
                Some(service) => {
                    desired.insert(service.id.clone(), service);
                }
                None => report.skipped += 1,
            }
        }

        for local in self.services.by_tag(DiscoveryTag::Catalog).await {
            if !desired.contains_key(&local.id) && self.services.remove(&local).await {
                report.removed += 1;
            }
        }

        for (id, service) in desired {
            match self.services.get(&id).await {
                Some(existing) if existing == service => report.unchanged += 1,
                Some(existing) if !existing.is_catalog() => {
                    warn!("Catalog id {} collides with an operator service", id);
                    report.skipped += 1;
                }
                Some(existing) => {
                    let users = self.services.connections().users_of(&id).await;
                    self.services.remove(&existing).await;
                    self.services.add(service).await;
                    let mut restored = 0;
                    for user in users {
                        if self.services.connect(user, &id).await {
                            restored += 1;
                        }
                    }
                    info!("Catalog service {} changed, restored {} connections", id, restored);
                    report.updated += 1;
                }
                None => {
                    if self.services.add(service).await {
                        report.added += 1;
                    }
                }
            }
        }

        debug!("Catalog reconciliation: {:?}", report);
        report
    }

    fn resolve(&self, entry: &CatalogEntry) -> Option<Service> {
        let ip = entry.effective_address();
        let mut hosts = self.hosts.hosts_by_ip(ip);
        if hosts.len() != 1 {
            debug!(
                "Catalog entry {} at {} matches {} hosts, ignoring",
                entry.id,
                ip,
                hosts.len()
            );
            return None;
        }
        let host = hosts.remove(0);

        match Service::new(
            ServiceId::new(entry.id.clone()),
            host,
            entry.port,
            entry.name.clone(),
            DiscoveryTag::Catalog,
        ) {
            Ok(service) => Some(match &entry.icon {
                Some(icon) => service.with_icon(icon.clone()),
                None => service,
            }),
            Err(e) => {
                warn!("Catalog entry {} rejected: {}", entry.id, e);
                None
            }
        }
    }
}

/// Long-poll loop keeping the store in step with one catalog
pub struct CatalogSync {
    reconciler: Reconciler,
    config: CatalogConfig,
    task: Mutex<Option<smol::Task<()>>>,
}

impl CatalogSync {
    /// Create a disconnected synchronizer
    pub fn new(reconciler: Reconciler, config: CatalogConfig) -> Self {
        Self {
            reconciler,
            config,
            task: Mutex::new(None),
        }
    }

    /// Reconciler used by the loop
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Start following `client`, replacing any previous catalog
    pub async fn connect(&self, client: Arc<dyn CatalogClient>) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.cancel().await;
            info!("Replaced previous catalog connection");
        }
        *task = Some(smol::spawn(follow(
            client,
            self.reconciler.clone(),
            self.config.clone(),
        )));
    }

    /// Stop following the catalog
    ///
    /// Cancels any in-flight blocking query. Services already imported stay
    /// registered. Returns false if no catalog was connected.
    pub async fn disconnect(&self) -> bool {
        match self.task.lock().await.take() {
            Some(task) => {
                task.cancel().await;
                info!("Disconnected from service catalog");
                true
            }
            None => false,
        }
    }

    /// Whether a catalog is being followed
    pub async fn is_connected(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

async fn follow(client: Arc<dyn CatalogClient>, reconciler: Reconciler, config: CatalogConfig) {
    let mut index = 0u64;
    loop {
        match client.snapshot(index, config.wait()).await {
            Ok(snapshot) => {
                if index != 0 && snapshot.index < index {
                    info!(
                        "Catalog index went back from {} to {}, resyncing",
                        index, snapshot.index
                    );
                    index = 0;
                    continue;
                }
                reconciler.reconcile(&snapshot.entries).await;
                // an index of 0 would turn every query into a non-blocking one
                index = snapshot.index.max(1);
            }
            Err(e) => {
                warn!("Catalog query failed: {}; retrying in {:?}", e, config.retry());
                index = 0;
                smol::Timer::after(config.retry()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::controller::{MemoryHostDirectory, MemoryRuleBackend};
    use crate::discovery::catalog::CatalogSnapshot;
    use crate::installer::RuleInstaller;
    use crate::models::{ConnectPoint, Host};
    use crate::network::GraphTopology;
    use crate::store::ConnectionStore;
    use async_trait::async_trait;
    use pnet::util::MacAddr;
    use std::collections::VecDeque;
    use std::net::IpAddr;
    use std::time::Duration;

    fn host(last: u8, port: u32) -> Host {
        Host::new(
            MacAddr::new(0, 0, 0, 0, 0, last),
            [IpAddr::from([10, 0, 0, last])],
            ConnectPoint::new("of:1", port),
        )
        .unwrap()
    }

    fn entry(id: &str, name: &str, last: u8, port: u16) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: name.to_string(),
            address: None,
            node_address: IpAddr::from([10, 0, 0, last]),
            port,
            icon: None,
        }
    }

    fn reconciler() -> (Reconciler, Arc<MemoryHostDirectory>) {
        let hosts = Arc::new(MemoryHostDirectory::new());
        hosts.add_host(host(4, 4));
        hosts.add_host(host(5, 5));
        hosts.add_host(host(10, 10));
        let installer = Arc::new(RuleInstaller::new(
            hosts.clone(),
            Arc::new(GraphTopology::new()),
            Arc::new(MemoryRuleBackend::new()),
            &PortalConfig::default(),
        ));
        let services = Arc::new(ServiceStore::new(Arc::new(ConnectionStore::new(installer))));
        (Reconciler::new(services, hosts.clone()), hosts)
    }

    #[smol_potat::test]
    async fn test_reconcile_add_remove() {
        let (r, _) = reconciler();
        let report = r
            .reconcile(&[entry("ssh-1", "ssh", 4, 22), entry("web-1", "web", 5, 80)])
            .await;
        assert_eq!(report.added, 2);
        assert_eq!(r.services.len().await, 2);

        let report = r.reconcile(&[entry("ssh-1", "ssh", 4, 22)]).await;
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.removed, 1);
        assert!(r.services.get(&ServiceId::new("web-1")).await.is_none());
    }

    #[smol_potat::test]
    async fn test_manual_services_untouched() {
        let (r, _) = reconciler();
        let manual = Service::manual("portal", host(5, 5), IpAddr::from([10, 0, 0, 5]), 80).unwrap();
        r.services.add(manual.clone()).await;

        r.reconcile(&[]).await;
        assert!(r.services.contains(&manual).await);
    }

    #[smol_potat::test]
    async fn test_duplicate_ids_dropped() {
        let (r, _) = reconciler();
        r.reconcile(&[entry("ssh-1", "ssh", 4, 22)]).await;

        let report = r
            .reconcile(&[entry("ssh-1", "ssh", 4, 22), entry("ssh-1", "ssh", 5, 22)])
            .await;
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.removed, 1);
        assert!(r.services.is_empty().await);
    }

    #[smol_potat::test]
    async fn test_unresolvable_entry_skipped() {
        let (r, _) = reconciler();
        let report = r.reconcile(&[entry("db-1", "db", 99, 5432)]).await;
        assert_eq!(report.skipped, 1);
        assert!(r.services.is_empty().await);
    }

    #[smol_potat::test]
    async fn test_changed_service_keeps_users() {
        let (r, _) = reconciler();
        r.reconcile(&[entry("ssh-1", "ssh", 4, 22)]).await;
        let id = ServiceId::new("ssh-1");
        assert!(r.services.connect(host(10, 10), &id).await);

        let report = r.reconcile(&[entry("ssh-1", "ssh", 4, 2222)]).await;
        assert_eq!(report.updated, 1);
        assert_eq!(r.services.get(&id).await.unwrap().port, 2222);

        let connections = r.services.connections().by_service(&id).await;
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].service.port, 2222);
    }

    /// Replays a fixed sequence of snapshots, then stays silent
    struct ScriptedCatalog {
        script: std::sync::Mutex<VecDeque<crate::error::Result<CatalogSnapshot>>>,
        calls: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl CatalogClient for ScriptedCatalog {
        async fn snapshot(
            &self,
            index: u64,
            _wait: Duration,
        ) -> crate::error::Result<CatalogSnapshot> {
            self.calls.lock().unwrap().push(index);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => futures::future::pending().await,
            }
        }
    }

    #[smol_potat::test]
    async fn test_follow_resets_on_index_regression() {
        let (r, _) = reconciler();
        let catalog = Arc::new(ScriptedCatalog {
            script: std::sync::Mutex::new(VecDeque::from(vec![
                Ok(CatalogSnapshot {
                    index: 10,
                    entries: vec![entry("ssh-1", "ssh", 4, 22)],
                }),
                Ok(CatalogSnapshot {
                    index: 3,
                    entries: vec![],
                }),
                Ok(CatalogSnapshot {
                    index: 4,
                    entries: vec![entry("web-1", "web", 5, 80)],
                }),
            ])),
            calls: std::sync::Mutex::new(Vec::new()),
        });

        let sync = CatalogSync::new(r.clone(), CatalogConfig::default());
        sync.connect(catalog.clone()).await;
        smol::Timer::after(Duration::from_millis(100)).await;
        assert!(sync.disconnect().await);
        assert!(!sync.is_connected().await);

        assert_eq!(*catalog.calls.lock().unwrap(), vec![0, 10, 0, 4]);
        assert!(r.services.get(&ServiceId::new("ssh-1")).await.is_none());
        assert!(r.services.get(&ServiceId::new("web-1")).await.is_some());
    }
}
