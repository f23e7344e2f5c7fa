//! Readiness-driven relay loop.
//!
//! A single thread owns the listener and the slot table. Each turn:
//!
//! 1. computes, from every slot's buffer occupancy, which descriptors are
//!    interesting for reading and writing;
//! 2. blocks in `poll(2)` until something is ready (no timeout);
//! 3. drains pending accepts from the listener;
//! 4. services every ready slot with at most one non-blocking read or write
//!    per ready descriptor, tearing the pair down on close or error.
//!
//! Interest is recomputed from scratch every turn, which gives natural
//! backpressure: a full buffer removes read interest on the side feeding it.

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::resolver::OriginResolver;
use super::slot::{ConnectError, Side, SlotState, Transfer};
use super::stats::RelayStats;
use super::table::{AllocateError, SlotId, SlotTable};
use crate::error::RelayError;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;

/// Default per-direction buffer capacity in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 5;

/// How long the listener is left out of the wait after a hard accept error.
const ACCEPT_BACKOFF_MS: u16 = 100;

/// Configuration for a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections (slot table capacity).
    pub max_connections: usize,
    /// Capacity of each direction's buffer.
    pub buffer_capacity: usize,
    /// Listen backlog.
    pub backlog: i32,
}

impl RelayConfig {
    /// Create a new relay configuration with default limits.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_connections == 0 {
            return Err(RelayError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(RelayError::Config(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.backlog < 1 {
            return Err(RelayError::Config("backlog must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Outcome of one loop turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Continue,
    Shutdown,
}

/// Wakes the relay loop and asks it to stop.
///
/// Cloneable and usable from any thread, including signal handlers run by
/// `ctrlc` on their own thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    trigger: Arc<UnixStream>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // A full socket buffer already carries a pending wake-up.
        let _ = (&*self.trigger).write(&[1]);
    }
}

/// Why a slot was torn down.
#[derive(Debug)]
enum CloseReason {
    PeerClosed(Side),
    HungUp(Side),
    Io { side: Side, error: io::Error },
    ConnectFailed(ConnectError),
}

impl CloseReason {
    fn is_error(&self) -> bool {
        !matches!(self, CloseReason::PeerClosed(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed(side) => write!(f, "{side} closed the connection"),
            CloseReason::HungUp(side) => write!(f, "{side} hung up"),
            CloseReason::Io { side, error } => write!(f, "{side} io error: {error}"),
            CloseReason::ConnectFailed(e) => write!(f, "origin connect failed: {e}"),
        }
    }
}

/// Readiness reported for one slot.
#[derive(Debug, Clone, Copy)]
struct SlotReadiness {
    id: SlotId,
    client: PollFlags,
    origin: PollFlags,
}

impl SlotReadiness {
    fn flags(&self, side: Side) -> PollFlags {
        match side {
            Side::Client => self.client,
            Side::Origin => self.origin,
        }
    }
}

/// Everything `poll` reported in one turn.
#[derive(Debug, Default)]
struct Readiness {
    shutdown: bool,
    listener: bool,
    slots: Vec<SlotReadiness>,
}

/// The relay: listener, slot table and origin, driven by one thread.
pub struct Relay {
    config: RelayConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    table: SlotTable,
    origin: OriginResolver,
    stats: Arc<RelayStats>,
    wakeup: UnixStream,
    shutdown: ShutdownHandle,
    /// Set after an accept error such as `EMFILE`; the next wait skips the
    /// listener and is bounded by [`ACCEPT_BACKOFF_MS`].
    accept_backoff: bool,
}

impl Relay {
    /// Bind the listener and allocate the slot table.
    pub fn bind(config: RelayConfig, origin: OriginResolver) -> Result<Self, RelayError> {
        config.validate()?;

        let listener = listen(config.bind_addr, config.backlog).map_err(|source| {
            RelayError::Listen {
                addr: config.bind_addr,
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;

        let (wakeup, trigger) = UnixStream::pair()?;
        wakeup.set_nonblocking(true)?;
        trigger.set_nonblocking(true)?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            buffer_capacity = config.buffer_capacity,
            "Listener bound"
        );

        Ok(Self {
            table: SlotTable::new(config.max_connections, config.buffer_capacity),
            config,
            listener,
            local_addr,
            origin,
            stats: Arc::new(RelayStats::default()),
            wakeup,
            shutdown: ShutdownHandle {
                trigger: Arc::new(trigger),
            },
            accept_backoff: false,
        })
    }

    /// Get the local address this relay is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared counters, readable from other threads.
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    /// Run until shut down or until a fatal error.
    ///
    /// Every live connection is closed before returning.
    pub fn run(&mut self) -> Result<(), RelayError> {
        info!(
            bind_addr = %self.local_addr,
            origin_host = %self.origin.host(),
            origin_port = self.origin.port(),
            "Relay started"
        );

        let result = loop {
            match self.turn() {
                Ok(Turn::Continue) => {}
                Ok(Turn::Shutdown) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let closed = self.table.teardown_all();
        self.stats.record_shutdown(closed);
        info!(closed_connections = closed, "Relay stopped");
        result
    }

    /// Run one iteration: wait, accept, service.
    pub fn turn(&mut self) -> Result<Turn, RelayError> {
        let waited = self.wait();
        self.accept_backoff = false;
        let Some(readiness) = waited? else {
            trace!("Readiness wait interrupted");
            return Ok(Turn::Continue);
        };

        if readiness.shutdown {
            info!("Shutdown requested");
            return Ok(Turn::Shutdown);
        }

        if readiness.listener {
            self.accept_pending()?;
        }

        for ready in readiness.slots {
            if let Err(reason) = self.service(ready) {
                self.close(ready.id, reason);
            }
        }

        Ok(Turn::Continue)
    }

    /// Build the interest set and block until something is ready.
    ///
    /// Returns `None` when the wait was interrupted by a signal.
    fn wait(&self) -> Result<Option<Readiness>, RelayError> {
        let mut fds = Vec::with_capacity(2 + 2 * self.table.len());
        let mut owners = Vec::with_capacity(2 * self.table.len());

        let (listener_flags, timeout) = self.listener_interest();
        fds.push(PollFd::new(self.wakeup.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.listener.as_fd(), listener_flags));

        for (id, slot) in self.table.iter() {
            let Some(interest) = slot.interest() else {
                continue;
            };
            for side in [Side::Client, Side::Origin] {
                let wanted = interest.side(side);
                if wanted.is_empty() {
                    continue;
                }
                if let Some(stream) = slot.stream(side) {
                    fds.push(PollFd::new(stream.as_fd(), wanted.poll_flags()));
                    owners.push((id, side));
                }
            }
        }

        trace!(descriptors = fds.len(), "Waiting for readiness");
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(e) => return Err(RelayError::Poll(e)),
        }

        let revents = |fd: &PollFd<'_>| fd.revents().unwrap_or(PollFlags::empty());
        let mut readiness = Readiness {
            shutdown: !revents(&fds[0]).is_empty(),
            listener: revents(&fds[1]).contains(PollFlags::POLLIN),
            slots: Vec::new(),
        };

        // Both descriptors of a slot were pushed back to back.
        for (fd, &(id, side)) in fds[2..].iter().zip(&owners) {
            let flags = revents(fd);
            if flags.is_empty() {
                continue;
            }
            if readiness.slots.last().map(|last| last.id) != Some(id) {
                readiness.slots.push(SlotReadiness {
                    id,
                    client: PollFlags::empty(),
                    origin: PollFlags::empty(),
                });
            }
            if let Some(entry) = readiness.slots.last_mut() {
                match side {
                    Side::Client => entry.client = flags,
                    Side::Origin => entry.origin = flags,
                }
            }
        }

        Ok(Some(readiness))
    }

    /// Listener interest and wait timeout for the next turn.
    fn listener_interest(&self) -> (PollFlags, PollTimeout) {
        if self.accept_backoff {
            (PollFlags::empty(), PollTimeout::from(ACCEPT_BACKOFF_MS))
        } else {
            (PollFlags::POLLIN, PollTimeout::NONE)
        }
    }

    /// Accept every connection the listener has queued.
    fn accept_pending(&mut self) -> Result<(), RelayError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = ACCEPT_BACKOFF_MS,
                        "Accept error, pausing accepts"
                    );
                    self.accept_backoff = true;
                    return Ok(());
                }
            }
        }
    }

    /// Give an accepted client a slot and start dialing the origin.
    fn admit(&mut self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), RelayError> {
        self.stats.record_accepted();

        let id = match self.table.allocate(stream, peer_addr) {
            Ok(id) => id,
            Err(AllocateError::Full { capacity, client }) => {
                self.stats.record_rejected();
                warn!(
                    peer_addr = %peer_addr,
                    max_connections = capacity,
                    "Connection rejected: max connections reached"
                );
                drop(client);
                return Ok(());
            }
            Err(e) => {
                warn!(peer_addr = %peer_addr, error = %e, "Failed to set up client connection");
                return Ok(());
            }
        };
        self.stats.record_opened();

        // Blocks only if this is the first dial and the lookup is still running.
        let origin_addr = match self.origin.address() {
            Ok(addr) => addr,
            Err(e) => {
                self.table.teardown(id);
                self.stats.record_closed();
                return Err(e.into());
            }
        };

        let connect = match self.table.get_mut(id) {
            Some(slot) => slot.begin_origin_connect(origin_addr),
            None => Err(ConnectError::NotConnecting),
        };
        if let Err(e) = connect {
            self.close(id, CloseReason::ConnectFailed(e));
            return Ok(());
        }

        info!(
            peer_addr = %peer_addr,
            slot = id,
            origin_addr = %origin_addr,
            "Connection accepted"
        );
        Ok(())
    }

    /// Service one ready slot: connect completion, then writes, then reads.
    fn service(&mut self, ready: SlotReadiness) -> Result<(), CloseReason> {
        let stats = &self.stats;
        let Some(slot) = self.table.get_mut(ready.id) else {
            return Ok(());
        };

        if slot.state() == SlotState::Connecting && !ready.origin.is_empty() {
            slot.finish_origin_connect().map_err(CloseReason::ConnectFailed)?;
            debug!(slot = ready.id, "Origin connected");
        }

        let error_flags = PollFlags::POLLERR | PollFlags::POLLNVAL;
        for side in [Side::Origin, Side::Client] {
            if ready.flags(side).intersects(error_flags) {
                let error = slot
                    .stream(side)
                    .and_then(|stream| stream.take_error().ok().flatten())
                    .unwrap_or_else(|| io::Error::other("socket error reported by poll"));
                return Err(CloseReason::Io { side, error });
            }
        }

        // Writes first: bytes that can leave now are flushed before a close
        // observed by a read tears the pair down.
        let established = slot.state() == SlotState::Established;
        for side in [Side::Origin, Side::Client] {
            if side == Side::Origin && !established {
                continue;
            }
            if !ready.flags(side).contains(PollFlags::POLLOUT) {
                continue;
            }
            match slot.send(side) {
                Ok(Transfer::Moved(n)) => {
                    trace!(slot = ready.id, side = %side, bytes = n, "Sent");
                    match side {
                        Side::Origin => stats.record_to_origin(n),
                        Side::Client => stats.record_to_client(n),
                    }
                }
                Ok(_) => {}
                Err(error) => return Err(CloseReason::Io { side, error }),
            }
        }

        for side in [Side::Client, Side::Origin] {
            let flags = ready.flags(side);
            if !flags.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                continue;
            }
            match slot.receive(side) {
                Ok(Transfer::Moved(n)) => {
                    trace!(slot = ready.id, side = %side, bytes = n, "Received");
                }
                Ok(Transfer::Closed) => return Err(CloseReason::PeerClosed(side)),
                // Hang-up with no room to read the remaining bytes.
                Ok(Transfer::WouldBlock) if !flags.contains(PollFlags::POLLIN) => {
                    return Err(CloseReason::HungUp(side));
                }
                Ok(Transfer::WouldBlock) => {}
                Err(error) => return Err(CloseReason::Io { side, error }),
            }
        }

        Ok(())
    }

    /// Tear a slot down and log why.
    fn close(&mut self, id: SlotId, reason: CloseReason) {
        let Some(slot) = self.table.get(id) else {
            return;
        };
        let peer_addr = slot.peer_addr();
        let bytes_to_origin = slot.bytes_to_origin();
        let bytes_to_client = slot.bytes_to_client();

        if !self.table.teardown(id) {
            return;
        }
        self.stats.record_closed();
        // After the close, so a failed connect is never observed with the
        // slot still counted as active.
        if matches!(reason, CloseReason::ConnectFailed(_)) {
            self.stats.record_connect_failed();
        }

        if reason.is_error() {
            warn!(
                slot = id,
                peer_addr = ?peer_addr,
                bytes_to_origin,
                bytes_to_client,
                reason = %reason,
                "Connection closed"
            );
        } else {
            info!(
                slot = id,
                peer_addr = ?peer_addr,
                bytes_to_origin,
                bytes_to_client,
                reason = %reason,
                "Connection closed"
            );
        }
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .field("origin", &self.origin)
            .field("live_connections", &self.table.len())
            .finish()
    }
}

/// Bind a non-blocking listener with `SO_REUSEADDR` and a bounded backlog.
fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
