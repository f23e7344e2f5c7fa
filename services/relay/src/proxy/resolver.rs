//! One-shot origin name resolution.
//!
//! The origin host is resolved on a background thread so the blocking lookup
//! never runs on the event-loop thread. The result travels back through a
//! one-shot channel and is received at most once, the first time a connection
//! needs it; every later call returns the cached result.

use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Resolution failures. Fatal to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("failed to resolve {host}:{port}: {reason}")]
    Lookup {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("{host}:{port} resolved to no addresses")]
    NoAddress { host: String, port: u16 },

    #[error("resolver thread for {host}:{port} exited without publishing a result")]
    Aborted { host: String, port: u16 },
}

enum State {
    Pending(oneshot::Receiver<Result<SocketAddr, ResolveError>>),
    Ready(Result<SocketAddr, ResolveError>),
}

/// Handle to the origin address, resolved once.
pub struct OriginResolver {
    host: String,
    port: u16,
    state: State,
}

impl OriginResolver {
    /// Start resolving `host:port` with the system resolver.
    pub fn spawn(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let lookup_host = host.clone();
        Self::spawn_with(host, port, move || lookup(&lookup_host, port))
    }

    /// Start resolving with a caller-supplied lookup, run exactly once on a
    /// background thread.
    pub fn spawn_with<F>(host: impl Into<String>, port: u16, lookup: F) -> Self
    where
        F: FnOnce() -> Result<SocketAddr, ResolveError> + Send + 'static,
    {
        let host = host.into();
        let (tx, rx) = oneshot::channel();

        let spawned = thread::Builder::new()
            .name("origin-resolver".to_string())
            .spawn(move || {
                // The receiver may be gone if the relay shut down first.
                let _ = tx.send(lookup());
            });

        let state = match spawned {
            Ok(_) => State::Pending(rx),
            Err(e) => State::Ready(Err(ResolveError::Lookup {
                host: host.clone(),
                port,
                reason: format!("failed to spawn resolver thread: {e}"),
            })),
        };

        debug!(host = %host, port, "Origin resolution started");
        Self { host, port, state }
    }

    /// A resolver for an already-known address; never spawns a thread.
    pub fn fixed(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            state: State::Ready(Ok(addr)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the result has been received (or was known up front).
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// The resolved origin address.
    ///
    /// Blocks on the background lookup the first time only, if it has not
    /// finished yet. Every call returns the same result.
    pub fn address(&mut self) -> Result<SocketAddr, ResolveError> {
        if let State::Ready(result) = &self.state {
            return result.clone();
        }

        let aborted = ResolveError::Aborted {
            host: self.host.clone(),
            port: self.port,
        };
        let placeholder = State::Ready(Err(aborted.clone()));
        let result = match std::mem::replace(&mut self.state, placeholder) {
            State::Pending(rx) => rx.blocking_recv().unwrap_or(Err(aborted)),
            State::Ready(result) => result,
        };

        if let Ok(addr) = &result {
            info!(host = %self.host, port = self.port, addr = %addr, "Origin resolved");
        }
        self.state = State::Ready(result.clone());
        result
    }
}

impl std::fmt::Debug for OriginResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResolver")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn lookup(host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ResolveError::Lookup {
            host: host.to_string(),
            port,
            reason: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| ResolveError::NoAddress {
        host: host.to_string(),
        port,
    })
}
