//! Network topology and path selection
//!
//! This module handles:
//! - An in-memory topology graph that answers path queries
//! - Choosing one path among the candidates a topology returns
//! - Picking the egress port toward a destination attachment point

pub mod path;
pub mod topology;

pub use path::{egress_port, select_path};
pub use topology::GraphTopology;
