//! Service discovery from an external catalog

pub mod catalog;
pub mod sync;

pub use catalog::{CatalogClient, CatalogEntry, CatalogSnapshot, ConsulCatalog};
pub use sync::{CatalogSync, ReconcileReport, Reconciler};
