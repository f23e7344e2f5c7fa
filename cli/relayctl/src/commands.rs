//! CLI commands.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tproxy_admin_proto::{Command, GetTarget, Status, Token};

use crate::client::AdminClient;
use crate::error::CliError;
use crate::output::{print_response, OutputFormat};

/// relayctl - manage a running tproxy relay.
#[derive(Debug, Parser)]
#[command(name = "relayctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address of the relay's administrative service.
    #[arg(long, global = true, env = "TPROXY_ADMIN_ADDR", default_value = "127.0.0.1:8081")]
    addr: SocketAddr,

    /// Admin token (exactly 16 bytes).
    #[arg(long, global = true, env = "TPROXY_ADMIN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read a counter or a user list.
    Get {
        /// historic-connections, concurrent-connections, transferred-bytes,
        /// proxy-users or admin-users.
        target: GetTarget,
    },

    /// Enable or disable the protocol dissector.
    ToggleDissector {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Add a proxy user.
    AddProxyUser { username: String, password: String },

    /// Add an admin user with its own token.
    AddAdminUser { username: String, token: String },

    /// Remove a proxy user.
    DelProxyUser { username: String },

    /// Remove an admin user.
    DelAdminUser { username: String },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let token = parse_token(
            self.token
                .as_deref()
                .context("missing admin token; pass --token or set TPROXY_ADMIN_TOKEN")?,
        )?;
        let command = self.command.into_command()?;

        let client = AdminClient::new(self.addr, token);
        let response = client.send(command.clone()).await?;

        if response.status != Status::Ok {
            return Err(CliError::Status(response.status).into());
        }
        print_response(&command, &response, self.format);
        Ok(())
    }
}

impl Commands {
    fn into_command(self) -> Result<Command> {
        let command = match self {
            Commands::Get { target } => Command::Get(target),
            Commands::ToggleDissector { state } => {
                Command::ToggleDissector(matches!(state, Toggle::On))
            }
            Commands::AddProxyUser { username, password } => {
                Command::AddProxyUser { username, password }
            }
            Commands::AddAdminUser { username, token } => Command::AddAdminUser {
                username,
                token: parse_token(&token)?,
            },
            Commands::DelProxyUser { username } => Command::DelProxyUser { username },
            Commands::DelAdminUser { username } => Command::DelAdminUser { username },
        };
        Ok(command)
    }
}

fn parse_token(raw: &str) -> Result<Token> {
    raw.parse::<Token>()
        .map_err(CliError::from)
        .context("invalid token")
}
