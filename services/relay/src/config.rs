//! Relay configuration.
//!
//! Every option can be given on the command line or through a `TPROXY_*`
//! environment variable.

use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use tproxy_admin_proto::{Token, TOKEN_LEN};

use crate::admin::{AdminConfig, DEFAULT_ADMIN_ADDR};
use crate::error::RelayError;
use crate::proxy::{
    RelayConfig, DEFAULT_BACKLOG, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_CONNECTIONS,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// tproxy - transparent TCP relay to a single origin.
#[derive(Debug, Clone, Parser)]
#[command(name = "tproxy")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address the relay listens on.
    #[arg(long, env = "TPROXY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Origin host name or address.
    #[arg(long, env = "TPROXY_ORIGIN_HOST", default_value = "www.google.com")]
    pub origin_host: String,

    /// Origin port.
    #[arg(long, env = "TPROXY_ORIGIN_PORT", default_value_t = 80)]
    pub origin_port: u16,

    /// Maximum concurrent client connections.
    #[arg(long, env = "TPROXY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Capacity in bytes of each direction's buffer.
    #[arg(long, env = "TPROXY_BUFFER_CAPACITY", default_value_t = DEFAULT_BUFFER_CAPACITY)]
    pub buffer_capacity: usize,

    /// Listen backlog.
    #[arg(long, env = "TPROXY_BACKLOG", default_value_t = DEFAULT_BACKLOG)]
    pub backlog: i32,

    /// Address of the administrative service.
    #[arg(long, env = "TPROXY_ADMIN_LISTEN", default_value = DEFAULT_ADMIN_ADDR)]
    pub admin_listen: SocketAddr,

    /// Token of the bootstrap admin user. The administrative service is
    /// disabled when absent.
    #[arg(long, env = "TPROXY_ADMIN_TOKEN", hide_env_values = true)]
    pub admin_token: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "TPROXY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    /// Settings for the relay loop.
    pub fn relay(&self) -> Result<RelayConfig, RelayError> {
        let config = RelayConfig {
            bind_addr: self.listen,
            max_connections: self.max_connections,
            buffer_capacity: self.buffer_capacity,
            backlog: self.backlog,
        };
        config.validate()?;
        Ok(config)
    }

    /// Settings and bootstrap token for the administrative service, if enabled.
    pub fn admin(&self) -> Result<Option<(AdminConfig, Token)>, RelayError> {
        let Some(raw) = self.admin_token.as_deref() else {
            return Ok(None);
        };
        let token: Token = raw.parse().map_err(|_| {
            RelayError::Config(format!(
                "admin token must be exactly {TOKEN_LEN} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Some((AdminConfig::new(self.admin_listen), token)))
    }
}
