//! Output formatting for CLI commands.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tproxy_admin_proto::{Command, Response, ResponseBody, Status};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// JSON.
    Json,
}

/// JSON rendering of one exchange.
#[derive(Debug, Serialize)]
struct Receipt<'a> {
    method: tproxy_admin_proto::Method,
    target: u8,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a ResponseBody>,
}

/// Print a successful response.
pub fn print_response(command: &Command, response: &Response, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let receipt = Receipt {
                method: command.method(),
                target: command.target(),
                status: response.status,
                data: response.body.as_ref(),
            };
            match serde_json::to_string_pretty(&receipt) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{{}}"),
            }
        }
        OutputFormat::Text => match &response.body {
            Some(ResponseBody::Counter(value)) => println!("{value}"),
            Some(ResponseBody::Names(names)) if names.is_empty() => {
                println!("{}", "No users.".dimmed());
            }
            Some(ResponseBody::Names(names)) => {
                for name in names {
                    println!("{name}");
                }
            }
            None => print_success(&describe(command)),
        },
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

fn describe(command: &Command) -> String {
    match command {
        Command::Get(_) => "fetched".to_string(),
        Command::ToggleDissector(true) => "dissector enabled".to_string(),
        Command::ToggleDissector(false) => "dissector disabled".to_string(),
        Command::AddProxyUser { username, .. } => format!("proxy user {username} added"),
        Command::AddAdminUser { username, .. } => format!("admin user {username} added"),
        Command::DelProxyUser { username } => format!("proxy user {username} removed"),
        Command::DelAdminUser { username } => format!("admin user {username} removed"),
    }
}
