//! Captive portal connection engine for SDN-controlled networks
//!
//! Unauthenticated traffic is steered to a portal host. Once a user is
//! granted access to a service, bidirectional forwarding rules are installed
//! on every device along the path between the two.
//!
//! # Architecture
//!
//! The engine talks to its SDN controller only through the traits in
//! [`controller`], so it can run against a live controller or against the
//! in-memory stand-ins shipped in [`controller::memory`]. It uses:
//!
//! - `futures` locks and `async-channel` for the stores and event plumbing
//! - `smol` tasks for packet workers and the catalog long-poll
//! - `pnet` for packet parsing and rewriting
//! - `reqwest` for the Consul catalog client
//!
//! # Example
//!
//! ```no_run
//! use captive_portal::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> captive_portal::Result<()> {
//! let topology = Arc::new(GraphTopology::new());
//! let hosts = Arc::new(MemoryHostDirectory::new());
//!
//! let manager = PortalManager::new(
//!     PortalConfig::default(),
//!     Collaborators {
//!         devices: topology.clone(),
//!         hosts,
//!         topology,
//!         backend: Arc::new(MemoryRuleBackend::new()),
//!         packets: Arc::new(MemoryPacketIo::new()),
//!     },
//! )?;
//! manager.start().await?;
//! manager.set_portal("10.0.0.1".parse().unwrap(), 80).await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod installer;
pub mod manager;
pub mod models;
pub mod network;
pub mod redirect;
pub mod store;

pub use config::{CatalogConfig, PortalConfig, RedirectMode};
pub use error::{Error, Result};
pub use manager::{Collaborators, PortalManager};

/// Common imports
pub mod prelude {
    pub use crate::config::{PortalConfig, RedirectMode};
    pub use crate::controller::{
        DeviceDirectory, HostDirectory, HostEvent, HostEventKind, InboundPacket,
        MemoryHostDirectory, MemoryPacketIo, MemoryRuleBackend, PacketIo, RuleBackend,
        TopologyOracle,
    };
    pub use crate::discovery::{CatalogClient, CatalogEntry, CatalogSnapshot};
    pub use crate::error::{Error, Result};
    pub use crate::manager::{Collaborators, PortalManager};
    pub use crate::models::*;
    pub use crate::network::GraphTopology;
    pub use crate::redirect::Classification;
}
