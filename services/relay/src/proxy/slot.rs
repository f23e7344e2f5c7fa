//! Connection slot: one client stream, one origin stream, two buffers.
//!
//! A slot is the unit of atomic teardown. Its streams are owned here and only
//! [`Slot::teardown`] drops them, so both descriptors always close together
//! and a descriptor can never be closed twice.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

use nix::errno::Errno;
use nix::poll::PollFlags;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

use super::buffer::Buffer;

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for allocation.
    Empty,
    /// Client accepted, origin connect in flight.
    Connecting,
    /// Both streams live, relay proceeding.
    Established,
}

/// One end of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Origin,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Origin => f.write_str("origin"),
        }
    }
}

/// Readiness a descriptor is interested in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    pub fn poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.read {
            flags |= PollFlags::POLLIN;
        }
        if self.write {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }
}

/// Interest of both descriptors of a live slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInterest {
    pub client: Interest,
    pub origin: Interest,
}

impl SlotInterest {
    pub fn side(&self, side: Side) -> Interest {
        match side {
            Side::Client => self.client,
            Side::Origin => self.origin,
        }
    }
}

/// Outcome of one non-blocking transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved between the socket and the buffer.
    Moved(usize),
    /// Nothing to do right now; retry on the next readiness.
    WouldBlock,
    /// Peer closed its side (zero-byte read).
    Closed,
}

/// Origin connect failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to create origin socket: {0}")]
    Socket(#[source] io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("slot has no origin connect in flight")]
    NotConnecting,
}

/// A client/origin connection pair with its two buffers.
#[derive(Debug)]
pub struct Slot {
    state: SlotState,
    client: Option<TcpStream>,
    origin: Option<TcpStream>,
    /// Client to origin.
    inbound: Buffer,
    /// Origin to client.
    outbound: Buffer,
    peer_addr: Option<SocketAddr>,
    origin_addr: Option<SocketAddr>,
    bytes_to_origin: u64,
    bytes_to_client: u64,
}

impl Slot {
    /// Create an empty slot whose buffers hold `buffer_capacity` bytes each.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            state: SlotState::Empty,
            client: None,
            origin: None,
            inbound: Buffer::new(buffer_capacity),
            outbound: Buffer::new(buffer_capacity),
            peer_addr: None,
            origin_addr: None,
            bytes_to_origin: 0,
            bytes_to_client: 0,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.state == SlotState::Empty
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn inbound(&self) -> &Buffer {
        &self.inbound
    }

    pub fn outbound(&self) -> &Buffer {
        &self.outbound
    }

    pub fn bytes_to_origin(&self) -> u64 {
        self.bytes_to_origin
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client
    }

    pub fn stream(&self, side: Side) -> Option<&TcpStream> {
        match side {
            Side::Client => self.client.as_ref(),
            Side::Origin => self.origin.as_ref(),
        }
    }

    /// Take ownership of an accepted client stream.
    ///
    /// The stream is switched to non-blocking mode. On failure the stream is
    /// dropped (closed) and the slot stays empty.
    pub(crate) fn open(&mut self, client: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        debug_assert!(self.is_empty(), "opening a live slot");
        client.set_nonblocking(true)?;
        client.set_nodelay(true)?;

        self.inbound.reset();
        self.outbound.reset();
        self.client = Some(client);
        self.origin = None;
        self.peer_addr = Some(peer_addr);
        self.origin_addr = None;
        self.bytes_to_origin = 0;
        self.bytes_to_client = 0;
        self.state = SlotState::Connecting;
        Ok(())
    }

    /// Create a non-blocking origin socket and start connecting it.
    ///
    /// An in-progress connect is the expected outcome; the slot stays
    /// `Connecting` until the origin descriptor reports writability.
    pub fn begin_origin_connect(&mut self, addr: SocketAddr) -> Result<(), ConnectError> {
        if self.state != SlotState::Connecting || self.origin.is_some() {
            return Err(ConnectError::NotConnecting);
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ConnectError::Socket)?;
        socket.set_nonblocking(true).map_err(ConnectError::Socket)?;
        socket.set_nodelay(true).map_err(ConnectError::Socket)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(source) => return Err(ConnectError::Connect { addr, source }),
        }

        self.origin = Some(socket.into());
        self.origin_addr = Some(addr);
        Ok(())
    }

    /// Check the outcome of the in-flight origin connect.
    ///
    /// Called once the origin descriptor reports readiness while
    /// `Connecting`. Success moves the slot to `Established`.
    pub fn finish_origin_connect(&mut self) -> Result<(), ConnectError> {
        let (Some(origin), Some(addr)) = (self.origin.as_ref(), self.origin_addr) else {
            return Err(ConnectError::NotConnecting);
        };
        if self.state != SlotState::Connecting {
            return Err(ConnectError::NotConnecting);
        }

        // SO_ERROR carries the asynchronous connect result.
        if let Some(source) = origin
            .take_error()
            .map_err(|source| ConnectError::Connect { addr, source })?
        {
            return Err(ConnectError::Connect { addr, source });
        }
        origin
            .peer_addr()
            .map_err(|source| ConnectError::Connect { addr, source })?;

        self.state = SlotState::Established;
        Ok(())
    }

    /// Readiness interest derived from buffer occupancy.
    ///
    /// Returns `None` for slots without both descriptors.
    pub fn interest(&self) -> Option<SlotInterest> {
        if self.client.is_none() || self.origin.is_none() {
            return None;
        }

        let connecting = self.state == SlotState::Connecting;
        Some(SlotInterest {
            client: Interest {
                read: !self.inbound.is_full(),
                write: !self.outbound.is_empty(),
            },
            origin: Interest {
                read: !self.outbound.is_full(),
                write: !self.inbound.is_empty() || connecting,
            },
        })
    }

    /// One non-blocking receive from `side` into the buffer heading the other way.
    pub fn receive(&mut self, side: Side) -> io::Result<Transfer> {
        let (stream, buf) = match side {
            Side::Client => (self.client.as_ref(), &mut self.inbound),
            Side::Origin => (self.origin.as_ref(), &mut self.outbound),
        };
        let mut stream = stream.ok_or_else(not_connected)?;

        let window = buf.write_window();
        if window.is_empty() {
            return Ok(Transfer::WouldBlock);
        }

        match stream.read(window) {
            Ok(0) => Ok(Transfer::Closed),
            Ok(n) => {
                buf.advance_write(n).map_err(io::Error::other)?;
                Ok(Transfer::Moved(n))
            }
            Err(e) if is_transient(&e) => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// One non-blocking send toward `side` from the buffer feeding it.
    pub fn send(&mut self, side: Side) -> io::Result<Transfer> {
        let (stream, buf) = match side {
            Side::Client => (self.client.as_ref(), &mut self.outbound),
            Side::Origin => (self.origin.as_ref(), &mut self.inbound),
        };
        let mut stream = stream.ok_or_else(not_connected)?;

        let window = buf.read_window();
        if window.is_empty() {
            return Ok(Transfer::WouldBlock);
        }

        match stream.write(window) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf.advance_read(n).map_err(io::Error::other)?;
                match side {
                    Side::Client => self.bytes_to_client += n as u64,
                    Side::Origin => self.bytes_to_origin += n as u64,
                }
                Ok(Transfer::Moved(n))
            }
            Err(e) if is_transient(&e) => Ok(Transfer::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Close both streams, reset both buffers and mark the slot empty.
    ///
    /// Idempotent: tearing down an empty slot does nothing. Returns whether
    /// the slot was live.
    pub(crate) fn teardown(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }

        // Dropping the streams closes both descriptors.
        self.client.take();
        self.origin.take();
        self.inbound.reset();
        self.outbound.reset();
        self.peer_addr = None;
        self.origin_addr = None;
        self.state = SlotState::Empty;
        true
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(Errno::EINPROGRESS as i32)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "slot descriptor is closed")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::AsFd;
    use std::time::{Duration, Instant};

    use nix::poll::{poll, PollFd, PollTimeout};

    /// Accepted client stream plus the peer end held by the "client".
    pub(crate) fn client_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        (accepted, addr, peer)
    }

    fn wait_for(stream: &TcpStream, flags: PollFlags) -> PollFlags {
        let mut fds = [PollFd::new(stream.as_fd(), flags)];
        let n = poll(&mut fds, PollTimeout::from(2000u16)).unwrap();
        assert_eq!(n, 1, "descriptor never became ready");
        fds[0].revents().unwrap()
    }

    fn connected_slot(buffer_capacity: usize) -> (Slot, TcpStream, TcpStream) {
        let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (accepted, addr, client_peer) = client_pair();

        let mut slot = Slot::new(buffer_capacity);
        slot.open(accepted, addr).unwrap();
        slot.begin_origin_connect(origin_listener.local_addr().unwrap())
            .unwrap();
        let (origin_peer, _) = origin_listener.accept().unwrap();

        wait_for(slot.stream(Side::Origin).unwrap(), PollFlags::POLLOUT);
        slot.finish_origin_connect().unwrap();
        (slot, client_peer, origin_peer)
    }

    fn receive_until_moved(slot: &mut Slot, side: Side) -> usize {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match slot.receive(side).unwrap() {
                Transfer::Moved(n) => return n,
                Transfer::WouldBlock if Instant::now() < deadline => {
                    wait_for(slot.stream(side).unwrap(), PollFlags::POLLIN);
                }
                other => panic!("unexpected transfer outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_slot_has_no_interest() {
        let slot = Slot::new(64);
        assert_eq!(slot.state(), SlotState::Empty);
        assert!(slot.interest().is_none());
    }

    #[test]
    fn test_connecting_slot_wants_origin_writability() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (accepted, addr, _client_peer) = client_pair();

        let mut slot = Slot::new(64);
        slot.open(accepted, addr).unwrap();
        assert_eq!(slot.state(), SlotState::Connecting);
        // No origin descriptor yet.
        assert!(slot.interest().is_none());

        slot.begin_origin_connect(origin_listener.local_addr().unwrap())
            .unwrap();
        let interest = slot.interest().unwrap();
        assert!(interest.origin.write);
        assert!(interest.origin.read);
        assert!(interest.client.read);
        assert!(!interest.client.write);
    }

    #[test]
    fn test_connect_completion_establishes() {
        let (slot, _client, _origin) = connected_slot(64);
        assert_eq!(slot.state(), SlotState::Established);

        let interest = slot.interest().unwrap();
        assert!(!interest.origin.write, "nothing pending for the origin");
        assert!(!interest.client.write, "nothing pending for the client");
    }

    #[test]
    fn test_connect_failure_is_reported() {
        // Grab a free port and close it so the connect is refused.
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let (accepted, addr, _client_peer) = client_pair();
        let mut slot = Slot::new(64);
        slot.open(accepted, addr).unwrap();

        match slot.begin_origin_connect(dead_addr) {
            Err(ConnectError::Connect { .. }) => {}
            Ok(()) => {
                wait_for(slot.stream(Side::Origin).unwrap(), PollFlags::POLLOUT);
                assert!(slot.finish_origin_connect().is_err());
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert_ne!(slot.state(), SlotState::Established);
    }

    #[test]
    fn test_relay_ping_client_to_origin() {
        let (mut slot, mut client, mut origin) = connected_slot(1024);

        client.write_all(b"ping").unwrap();
        assert_eq!(receive_until_moved(&mut slot, Side::Client), 4);
        assert_eq!(slot.inbound().pending(), 4);
        assert!(slot.interest().unwrap().origin.write);

        assert_eq!(slot.send(Side::Origin).unwrap(), Transfer::Moved(4));
        assert_eq!(slot.bytes_to_origin(), 4);

        let mut received = [0u8; 4];
        origin.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"ping");
    }

    #[test]
    fn test_full_outbound_stops_origin_reads() {
        let (mut slot, _client, mut origin) = connected_slot(8);

        origin.write_all(b"0123456789").unwrap();
        let mut total = 0;
        while total < 8 {
            total += receive_until_moved(&mut slot, Side::Origin);
        }

        assert!(slot.outbound().is_full());
        let interest = slot.interest().unwrap();
        assert!(!interest.origin.read, "backpressure must stop origin reads");
        assert!(interest.client.write);
    }

    #[test]
    fn test_orderly_close_is_reported() {
        let (mut slot, client, _origin) = connected_slot(64);
        drop(client);

        wait_for(slot.stream(Side::Client).unwrap(), PollFlags::POLLIN);
        assert_eq!(slot.receive(Side::Client).unwrap(), Transfer::Closed);
    }

    #[test]
    fn test_teardown_closes_both_streams() {
        let (mut slot, mut client, mut origin) = connected_slot(64);

        assert!(slot.teardown());
        assert_eq!(slot.state(), SlotState::Empty);
        assert!(slot.stream(Side::Client).is_none());
        assert!(slot.stream(Side::Origin).is_none());

        // Both peers observe EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(origin.read(&mut buf).unwrap(), 0);

        // Second teardown is a no-op.
        assert!(!slot.teardown());
    }

    #[test]
    fn test_send_without_pending_is_noop() {
        let (mut slot, _client, _origin) = connected_slot(64);
        assert_eq!(slot.send(Side::Client).unwrap(), Transfer::WouldBlock);
        assert_eq!(slot.send(Side::Origin).unwrap(), Transfer::WouldBlock);
    }

    #[test]
    fn test_interest_poll_flags() {
        let both = Interest {
            read: true,
            write: true,
        };
        assert_eq!(both.poll_flags(), PollFlags::POLLIN | PollFlags::POLLOUT);
        assert!(Interest::default().is_empty());
        assert_eq!(Interest::default().poll_flags(), PollFlags::empty());
    }
}
