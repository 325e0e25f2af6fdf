//! In-memory stores for services and connections

pub mod connections;
pub mod services;

pub use connections::ConnectionStore;
pub use services::ServiceStore;
