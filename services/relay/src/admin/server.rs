//! Administrative TCP server.
//!
//! One request per connection: the client sends a request, half-closes, and
//! reads the response until EOF. The server runs on its own thread with a
//! current-thread tokio runtime and only shares the atomic [`RelayStats`] and
//! the [`AdminRegistry`] with the rest of the process.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};
use tproxy_admin_proto::{
    Command, DecodeError, GetTarget, ProtoError, Request, RequestHeader, Response, Status,
    HEADER_LEN,
};

use super::registry::{AdminRegistry, RegistryError};
use crate::proxy::RelayStats;

/// Default address of the administrative listener.
pub const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:8081";

/// Default maximum concurrent administrative connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default time allowed to receive a complete request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors while serving one administrative connection.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the request")]
    Timeout,

    #[error("malformed request: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to encode response: {0}")]
    Encode(#[from] ProtoError),
}

/// Configuration for the administrative server.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed to receive a complete request.
    pub request_timeout: Duration,
}

impl AdminConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// The administrative server.
pub struct AdminServer {
    config: AdminConfig,
    listener: TcpListener,
    registry: Arc<AdminRegistry>,
    stats: Arc<RelayStats>,
    conn_semaphore: Arc<Semaphore>,
}

impl AdminServer {
    pub async fn bind(
        config: AdminConfig,
        registry: Arc<AdminRegistry>,
        stats: Arc<RelayStats>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        Self::from_listener(listener, config, registry, stats)
    }

    /// Serve on an already-bound listener.
    pub fn from_listener(
        listener: TcpListener,
        config: AdminConfig,
        registry: Arc<AdminRegistry>,
        stats: Arc<RelayStats>,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Admin listener bound");

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            registry,
            stats,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the runtime is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(
                                peer_addr = %peer_addr,
                                "Admin connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    let server = Arc::clone(&self);
                    tokio::spawn(
                        async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                debug!(error = %e, "Admin connection error");
                            }
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("admin", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Admin accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), AdminError> {
        let response = match self.read_request(&mut stream).await {
            Ok((header, data)) => self.respond(&header, &data),
            Err(AdminError::Decode(e)) => {
                debug!(error = %e, "Malformed admin request");
                Response::error(e.status())
            }
            Err(e) => return Err(e),
        };

        stream.write_all(&response.encode()?).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Read the fixed header and its declared payload.
    async fn read_request(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(RequestHeader, Vec<u8>), AdminError> {
        let read = async {
            let mut header_bytes = [0u8; HEADER_LEN];
            stream.read_exact(&mut header_bytes).await?;
            let header = RequestHeader::decode(&header_bytes)?;

            // A short payload is reported as invalid data rather than dropped.
            let mut data = Vec::with_capacity(header.data_len as usize);
            (&mut *stream)
                .take(u64::from(header.data_len))
                .read_to_end(&mut data)
                .await?;
            Ok::<_, AdminError>((header, data))
        };

        tokio::time::timeout(self.config.request_timeout, read)
            .await
            .map_err(|_| AdminError::Timeout)?
    }

    /// Validate and execute one request.
    ///
    /// Checks run in order: version, method, target, authentication, data.
    fn respond(&self, header: &RequestHeader, data: &[u8]) -> Response {
        let request = Request::decode(header, data);

        let data_error = match &request {
            Ok(_) => None,
            Err(e @ DecodeError::InvalidData(_)) => Some(e),
            Err(e) => return Response::error(e.status()),
        };

        if !self.registry.authorize(&header.token) {
            warn!(
                method = header.method,
                target = header.target,
                "Admin request rejected: bad token"
            );
            return Response::error(Status::AuthError);
        }

        if let Some(e) = data_error {
            debug!(error = %e, "Invalid admin request data");
            return Response::error(Status::InvalidData);
        }

        match request {
            Ok(request) => self.execute(&request.command),
            Err(e) => Response::error(e.status()),
        }
    }

    fn execute(&self, command: &Command) -> Response {
        let response = match command {
            Command::Get(target) => self.get(*target),
            Command::ToggleDissector(enabled) => {
                self.registry.set_dissector(*enabled);
                Response::ok()
            }
            Command::AddProxyUser { username, password } => {
                registry_response(self.registry.add_proxy_user(username, password))
            }
            Command::AddAdminUser { username, token } => {
                registry_response(self.registry.add_admin_user(username, *token))
            }
            Command::DelProxyUser { username } => {
                registry_response(self.registry.del_proxy_user(username))
            }
            Command::DelAdminUser { username } => {
                registry_response(self.registry.del_admin_user(username))
            }
        };

        info!(
            method = %command.method(),
            target = command.target(),
            status = %response.status,
            "Admin request handled"
        );
        response
    }

    fn get(&self, target: GetTarget) -> Response {
        let snapshot = self.stats.snapshot();
        match target {
            GetTarget::HistoricConnections => {
                Response::counter(saturate(snapshot.connections_accepted))
            }
            GetTarget::ConcurrentConnections => {
                Response::counter(saturate(snapshot.connections_active))
            }
            GetTarget::TransferredBytes => Response::counter(saturate(snapshot.bytes_transferred())),
            GetTarget::ProxyUsersList => Response::names(self.registry.proxy_users()),
            GetTarget::AdminUsersList => Response::names(self.registry.admin_users()),
        }
    }
}

fn registry_response(result: Result<(), RegistryError>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => {
            debug!(error = %e, "Admin config change refused");
            Response::error(Status::InvalidData)
        }
    }
}

/// Counters are 32 bits on the wire.
fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Run the administrative server on a dedicated thread.
///
/// The listener is bound before this returns, so bind errors surface to the
/// caller. Safe to call from inside or outside a tokio runtime.
pub fn spawn(
    config: AdminConfig,
    registry: Arc<AdminRegistry>,
    stats: Arc<RelayStats>,
) -> io::Result<(SocketAddr, thread::JoinHandle<()>)> {
    let listener = std::net::TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let handle = thread::Builder::new()
        .name("admin".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Failed to build admin runtime");
                    return;
                }
            };

            let result = runtime.block_on(async move {
                let listener = TcpListener::from_std(listener)?;
                let server = AdminServer::from_listener(listener, config, registry, stats)?;
                Arc::new(server).run().await
            });
            if let Err(e) = result {
                error!(error = %e, "Admin server failed");
            }
        })?;

    Ok((local_addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tproxy_admin_proto::{ResponseBody, Token, TOKEN_LEN};

    fn token(fill: u8) -> Token {
        Token::new([fill; TOKEN_LEN])
    }

    async fn start_server() -> (SocketAddr, Arc<AdminRegistry>, Arc<RelayStats>) {
        let registry = Arc::new(AdminRegistry::new(token(b'a')));
        let stats = Arc::new(RelayStats::default());
        let server = AdminServer::bind(
            AdminConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::clone(&registry),
            Arc::clone(&stats),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(Arc::new(server).run());
        (addr, registry, stats)
    }

    async fn exchange(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    async fn send(addr: SocketAddr, request: Request) -> Response {
        let bytes = exchange(addr, &request.encode().unwrap()).await;
        Response::decode(&bytes, &request.command).unwrap()
    }

    #[tokio::test]
    async fn test_get_counters() {
        let (addr, _registry, stats) = start_server().await;
        stats.record_accepted();
        stats.record_opened();
        stats.record_accepted();
        stats.record_to_origin(100);
        stats.record_to_client(23);

        let response = send(
            addr,
            Request::new(token(b'a'), Command::Get(GetTarget::HistoricConnections)),
        )
        .await;
        assert_eq!(response.body, Some(ResponseBody::Counter(2)));

        let response = send(
            addr,
            Request::new(token(b'a'), Command::Get(GetTarget::ConcurrentConnections)),
        )
        .await;
        assert_eq!(response.body, Some(ResponseBody::Counter(1)));

        let response = send(
            addr,
            Request::new(token(b'a'), Command::Get(GetTarget::TransferredBytes)),
        )
        .await;
        assert_eq!(response.body, Some(ResponseBody::Counter(123)));
    }

    #[tokio::test]
    async fn test_bad_token_is_auth_error() {
        let (addr, _registry, _stats) = start_server().await;
        let response = send(
            addr,
            Request::new(token(b'x'), Command::Get(GetTarget::AdminUsersList)),
        )
        .await;
        assert_eq!(response.status, Status::AuthError);
    }

    #[tokio::test]
    async fn test_version_checked_before_auth() {
        let (addr, _registry, _stats) = start_server().await;
        let mut bytes = Request::new(token(b'x'), Command::Get(GetTarget::ProxyUsersList))
            .encode()
            .unwrap();
        bytes[0] = 9;

        let response = exchange(addr, &bytes).await;
        assert_eq!(response, vec![Status::InvalidVersion as u8]);
    }

    #[tokio::test]
    async fn test_auth_checked_before_data() {
        let (addr, _registry, _stats) = start_server().await;
        let mut bytes = Request::new(
            token(b'x'),
            Command::DelProxyUser {
                username: "bob".to_string(),
            },
        )
        .encode()
        .unwrap();
        // Corrupt the username with a separator.
        let last = bytes.len() - 1;
        bytes[last] = b':';

        let response = exchange(addr, &bytes).await;
        assert_eq!(response, vec![Status::AuthError as u8]);
    }

    #[tokio::test]
    async fn test_add_and_list_proxy_users() {
        let (addr, registry, _stats) = start_server().await;

        let add = Request::new(
            token(b'a'),
            Command::AddProxyUser {
                username: "bob".to_string(),
                password: "secret".to_string(),
            },
        );
        assert_eq!(send(addr, add.clone()).await.status, Status::Ok);
        assert_eq!(send(addr, add).await.status, Status::InvalidData);

        let response = send(
            addr,
            Request::new(token(b'a'), Command::Get(GetTarget::ProxyUsersList)),
        )
        .await;
        assert_eq!(
            response.body,
            Some(ResponseBody::Names(vec!["bob".to_string()]))
        );
        assert_eq!(registry.proxy_users(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_toggle_dissector() {
        let (addr, registry, _stats) = start_server().await;
        let response = send(addr, Request::new(token(b'a'), Command::ToggleDissector(true))).await;
        assert_eq!(response.status, Status::Ok);
        assert!(registry.dissector_enabled());
    }

    #[tokio::test]
    async fn test_short_payload_is_invalid_data() {
        let (addr, _registry, _stats) = start_server().await;
        let mut bytes = Request::new(
            token(b'a'),
            Command::DelProxyUser {
                username: "bob".to_string(),
            },
        )
        .encode()
        .unwrap();
        bytes.pop();

        let response = exchange(addr, &bytes).await;
        assert_eq!(response, vec![Status::InvalidData as u8]);
    }

    #[tokio::test]
    async fn test_truncated_request_gets_no_response() {
        let (addr, _registry, _stats) = start_server().await;
        let response = exchange(addr, &[1, 2, 3]).await;
        assert!(response.is_empty());
    }

    #[test]
    fn test_saturate() {
        assert_eq!(saturate(7), 7);
        assert_eq!(saturate(u64::from(u32::MAX) + 1), u32::MAX);
    }
}
