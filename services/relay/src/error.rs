//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::proxy::ResolveError;

/// Errors that stop the relay. Connection-scoped failures never surface
/// here; they end in a slot teardown.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener socket could not be created, bound or put into listen mode.
    #[error("failed to set up listener on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The origin address could not be resolved.
    #[error("origin resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The readiness wait failed for a reason other than a signal.
    #[error("readiness wait failed: {0}")]
    Poll(#[from] nix::Error),

    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Stable reason code for log lines.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Listen { .. } => "listen_failed",
            RelayError::Resolve(_) => "resolve_failed",
            RelayError::Poll(_) => "poll_failed",
            RelayError::Config(_) => "config_invalid",
            RelayError::Io(_) => "io_error",
        }
    }
}
