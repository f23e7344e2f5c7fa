//! Administrative protocol client.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tproxy_admin_proto::{Command, Request, Response, Token};

use crate::error::CliError;

/// Default time allowed for the whole exchange.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one relay's administrative service.
#[derive(Debug, Clone)]
pub struct AdminClient {
    addr: SocketAddr,
    token: Token,
    timeout: Duration,
}

impl AdminClient {
    pub fn new(addr: SocketAddr, token: Token) -> Self {
        Self {
            addr,
            token,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Send one command and decode the response.
    ///
    /// The response is returned whatever its status; callers decide what a
    /// non-ok status means.
    pub async fn send(&self, command: Command) -> Result<Response, CliError> {
        let request = Request::new(self.token, command);
        let bytes = request.encode()?;

        let raw = tokio::time::timeout(self.timeout, self.exchange(&bytes))
            .await
            .map_err(|_| CliError::Timeout)??;

        Ok(Response::decode(&raw, &request.command)?)
    }

    /// Write the request, half-close, read the response until EOF.
    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, CliError> {
        let connect_err = |source| CliError::Connect {
            addr: self.addr,
            source,
        };

        let mut stream = TcpStream::connect(self.addr).await.map_err(connect_err)?;
        stream.write_all(request).await.map_err(connect_err)?;
        stream.shutdown().await.map_err(connect_err)?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(connect_err)?;
        Ok(response)
    }
}
