//! Single-threaded TCP relay.
//!
//! This module provides:
//! - Bounded per-direction byte buffers
//! - Connection slots pairing a client with an origin connection
//! - A fixed-capacity slot table with free-list allocation
//! - One-shot background resolution of the origin address
//! - The readiness-driven event loop
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> SlotTable -> Slot ----inbound----> Origin
//!                                      ^                     |
//!                                      +----outbound---------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{OriginResolver, Relay, RelayConfig};
//!
//! let origin = OriginResolver::spawn("www.google.com", 80);
//! let config = RelayConfig::new("0.0.0.0:8080".parse()?);
//! let mut relay = Relay::bind(config, origin)?;
//! relay.run()?;
//! ```

mod buffer;
mod event_loop;
mod resolver;
mod slot;
mod stats;
mod table;

pub use buffer::{Buffer, BufferError};
pub use event_loop::{
    Relay, RelayConfig, ShutdownHandle, Turn, DEFAULT_BACKLOG, DEFAULT_BUFFER_CAPACITY,
    DEFAULT_MAX_CONNECTIONS,
};
pub use resolver::{OriginResolver, ResolveError};
pub use slot::{ConnectError, Interest, Side, Slot, SlotInterest, SlotState, Transfer};
pub use stats::{RelayStats, RelayStatsSnapshot};
pub use table::{AllocateError, SlotId, SlotTable};
