//! Service catalog clients
//!
//! A catalog answers one question: which services exist right now, and at
//! which change index. [`ConsulCatalog`] asks a Consul agent over HTTP using
//! blocking queries, so a request returns as soon as the catalog changes or
//! once the requested wait has elapsed.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Extra time granted on top of the blocking wait before a request is abandoned
const WAIT_GRACE: Duration = Duration::from_secs(10);

/// Response header carrying the catalog change index
const INDEX_HEADER: &str = "x-consul-index";

/// One service instance as listed by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Catalog-assigned instance id
    pub id: String,
    /// Service name
    pub name: String,
    /// Explicit service address, when the registration carries one
    pub address: Option<IpAddr>,
    /// Address of the catalog agent (node) hosting the instance
    pub node_address: IpAddr,
    /// Service port
    pub port: u16,
    /// Icon reference from the instance metadata
    pub icon: Option<String>,
}

impl CatalogEntry {
    /// Address the instance is reached at
    pub fn effective_address(&self) -> IpAddr {
        self.address.unwrap_or(self.node_address)
    }
}

/// Full listing at one catalog index
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    /// Change index of the listing
    pub index: u64,
    /// Every service instance
    pub entries: Vec<CatalogEntry>,
}

/// Source of catalog listings
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch the full listing
    ///
    /// With `index` above zero the call blocks until the catalog index moves
    /// past it or `wait` elapses, whichever comes first.
    async fn snapshot(&self, index: u64, wait: Duration) -> Result<CatalogSnapshot>;
}

/// Consul catalog reached over HTTP
///
/// Requests run on the blocking thread pool. Dropping a pending
/// [`snapshot`](CatalogClient::snapshot) abandons the request; the worker
/// thread is released once the request times out.
#[derive(Debug, Clone)]
pub struct ConsulCatalog {
    base: Url,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulServiceNode {
    #[serde(rename = "ServiceID")]
    service_id: String,
    service_name: String,
    #[serde(default)]
    service_address: String,
    address: String,
    service_port: u16,
    #[serde(default)]
    service_meta: Option<HashMap<String, String>>,
}

impl ConsulCatalog {
    /// Create a client for the agent at `addr`
    pub fn new(addr: SocketAddr) -> Result<Self> {
        let base = Url::parse(&format!("http://{}/", addr))
            .map_err(|e| Error::catalog(format!("bad agent address {}: {}", addr, e)))?;
        let http = Client::builder().build()?;
        Ok(Self { base, http })
    }

    /// URL of `segments` below the agent root, each segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::catalog(format!("{} cannot carry a path", self.base)))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    fn fetch(&self, index: u64, wait: Duration) -> Result<CatalogSnapshot> {
        let timeout = wait + WAIT_GRACE;
        let mut request = self
            .http
            .get(self.url(&["v1", "catalog", "services"])?)
            .timeout(timeout);
        if index > 0 {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", wait.as_secs())),
            ]);
        }
        let listing = request.send()?.error_for_status()?;
        let index = listing
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::catalog("response carries no X-Consul-Index"))?;
        let names: HashMap<String, Vec<String>> = listing.json()?;

        let mut names: Vec<String> = names.into_keys().collect();
        names.sort();

        let mut entries = Vec::new();
        for name in names {
            let nodes: Vec<ConsulServiceNode> = self
                .http
                .get(self.url(&["v1", "catalog", "service", &name])?)
                .timeout(timeout)
                .send()?
                .error_for_status()?
                .json()?;
            for node in nodes {
                entries.push(node.into_entry()?);
            }
        }

        debug!("Catalog index {} lists {} instances", index, entries.len());
        Ok(CatalogSnapshot { index, entries })
    }
}

#[async_trait]
impl CatalogClient for ConsulCatalog {
    async fn snapshot(&self, index: u64, wait: Duration) -> Result<CatalogSnapshot> {
        let catalog = self.clone();
        smol::unblock(move || catalog.fetch(index, wait)).await
    }
}

impl ConsulServiceNode {
    fn into_entry(self) -> Result<CatalogEntry> {
        let node_address: IpAddr = self.address.parse().map_err(|_| {
            Error::catalog(format!("node address {:?} is not an IP", self.address))
        })?;
        let address = if self.service_address.is_empty() {
            None
        } else {
            Some(self.service_address.parse().map_err(|_| {
                Error::catalog(format!(
                    "service address {:?} is not an IP",
                    self.service_address
                ))
            })?)
        };
        let icon = self.service_meta.and_then(|mut meta| meta.remove("icon"));

        Ok(CatalogEntry {
            id: self.service_id,
            name: self.service_name,
            address,
            node_address,
            port: self.service_port,
            icon,
        })
    }
}
