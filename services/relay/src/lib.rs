//! tproxy relay
//!
//! Single-threaded transparent TCP relay with an optional administrative
//! service.

pub mod admin;
pub mod config;
pub mod error;
pub mod proxy;

pub use error::RelayError;
pub use proxy::{OriginResolver, Relay, RelayConfig, RelayStats, ShutdownHandle};
