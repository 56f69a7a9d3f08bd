//! Miscellaneous utilities

use std::net::SocketAddr;

use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;

use crate::config::Config;

/// Default address mediaproxy binds to
const DEFAULT_ADDRESS: &str = "127.0.0.1:8080";

/// Get the value of ENV var, or a default
///
/// Only when:
/// - It is set
/// - It is not empty
pub fn env_var_or_else(var_name: &'static str, or_else: fn() -> String) -> String {
    use std::env::var;

    if let Ok(value) = var(var_name) {
        if !value.is_empty() {
            return value;
        }
    }

    or_else()
}

/// Setup tracing based on the verbosity flags, `RUST_LOG` takes precedence
pub fn setup_tracing(verbosity: &Verbosity<InfoLevel>) {
    use tracing_subscriber::fmt::SubscriberBuilder;
    use tracing_subscriber::EnvFilter;

    let builder = SubscriberBuilder::default()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(verbosity.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .with_target(false);

    // Only show log targets in debug builds
    #[cfg(debug_assertions)]
    let builder = builder.with_target(true);

    if let Err(err) = builder.try_init() {
        eprintln!("Setting default subscriber failed: {err}");
    }
}

/// Setup the address mediaproxy will bind to
pub fn setup_address(config: &Config) -> anyhow::Result<SocketAddr> {
    let mut address = config
        .address
        .as_ref()
        .map_or_else(
            || env_var_or_else("ADDRESS", || String::from(DEFAULT_ADDRESS)),
            Clone::clone,
        )
        .parse::<SocketAddr>()?;

    // optional override of just the port
    if let Some(port) = config.port {
        address.set_port(port);
    } else if let Ok(port) = std::env::var("PORT") {
        // only check non-empty strings
        if !port.is_empty() {
            let port = port.parse::<u16>()?;

            address.set_port(port);
        }
    }

    Ok(address)
}

/// Handler for graceful shutdown
///
/// Will listen to Ctrl+C to and initiate a shutdown, running streams are cut off
pub async fn graceful_shutdown() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Could not listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!("Could not listen for terminate signal: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Terminate signal received, starting graceful shutdown");
}
