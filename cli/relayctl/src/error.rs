//! Error handling and display for the CLI.

use std::net::SocketAddr;

use colored::Colorize;
use thiserror::Error;
use tproxy_admin_proto::{DecodeError, ProtoError, Status};

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("could not reach the admin service at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Status(Status),

    #[error("invalid request: {0}")]
    Request(#[from] ProtoError),

    #[error("malformed response: {0}")]
    Response(#[from] DecodeError),

    #[error("timed out waiting for the admin service")]
    Timeout,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Status(Status::AuthError) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check the token passed with --token or TPROXY_ADMIN_TOKEN.".yellow()
                );
            }
            CliError::Status(Status::InvalidVersion) => {
                eprintln!(
                    "\n{}",
                    "Hint: The relay speaks a different protocol version.".yellow()
                );
            }
            CliError::Connect { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Is the relay running with --admin-token set?".yellow()
                );
            }
            _ => {}
        }
    }
}
