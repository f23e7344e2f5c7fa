//! Administrative service.
//!
//! Serves the binary administrative protocol from `tproxy-admin-proto`:
//! relay counters from [`RelayStats`](crate::proxy::RelayStats) and user
//! management backed by an in-memory [`AdminRegistry`].

mod registry;
mod server;

pub use registry::{AdminRegistry, RegistryError, BOOTSTRAP_ADMIN};
pub use server::{
    spawn, AdminConfig, AdminError, AdminServer, DEFAULT_ADMIN_ADDR, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_REQUEST_TIMEOUT,
};
