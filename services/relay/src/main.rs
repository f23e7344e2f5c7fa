//! tproxy
//!
//! Transparent TCP relay. Every accepted client is paired with a fresh
//! connection to a single origin and bytes are copied verbatim both ways.
//!
//! This binary:
//! - Resolves the origin once, in the background
//! - Runs the relay loop on the main thread
//! - Optionally serves the administrative protocol on its own thread
//! - Stops cleanly on SIGINT/SIGTERM

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tproxy_relay::admin::{self, AdminRegistry};
use tproxy_relay::config::{Config, LogFormat};
use tproxy_relay::{OriginResolver, Relay, RelayError};

fn main() -> ExitCode {
    let config = Config::parse();
    init_tracing(&config);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let reason = e
                .downcast_ref::<RelayError>()
                .map_or("startup_failed", RelayError::reason_code);
            error!(reason, error = %format_args!("{e:#}"), "Relay failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to the configured level.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn run(config: Config) -> Result<()> {
    info!("Starting tproxy");
    info!(
        listen = %config.listen,
        origin_host = %config.origin_host,
        origin_port = config.origin_port,
        max_connections = config.max_connections,
        buffer_capacity = config.buffer_capacity,
        admin_enabled = config.admin_token.is_some(),
        "Configuration loaded"
    );

    let relay_config = config.relay().context("invalid relay configuration")?;
    let admin_config = config.admin().context("invalid admin configuration")?;

    let origin = OriginResolver::spawn(config.origin_host.clone(), config.origin_port);
    let mut relay = Relay::bind(relay_config, origin).context("failed to start relay")?;

    if let Some((admin_config, token)) = admin_config {
        let registry = Arc::new(AdminRegistry::new(token));
        let bind_addr = admin_config.bind_addr;
        // The admin thread is detached; it ends with the process.
        admin::spawn(admin_config, registry, relay.stats())
            .with_context(|| format!("failed to start admin service on {bind_addr}"))?;
    }

    let shutdown = relay.shutdown_handle();
    ctrlc::set_handler(move || shutdown.shutdown())
        .context("failed to install signal handler")?;

    relay.run().context("relay loop failed")?;

    let stats = relay.stats().snapshot();
    info!(
        connections_accepted = stats.connections_accepted,
        connections_rejected = stats.connections_rejected,
        bytes_transferred = stats.bytes_transferred(),
        "Shutdown complete"
    );
    Ok(())
}
