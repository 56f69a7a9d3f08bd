#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![doc = include_str!("../README.md")]

use std::process::exit;

use tokio::net::TcpListener;

use crate::app::app;
use crate::app::ServerState;
use crate::config::Config;
use crate::utils::graceful_shutdown;
use crate::utils::setup_address;

mod app;
mod config;
mod error;
mod metadata;
mod pipe;
mod range;
mod upstream;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // tracing is set up while reading the config, it needs the verbosity flags
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Could not handle arguments: {err}");
            exit(1);
        }
    };

    let address = match setup_address(&config) {
        Ok(address) => address,
        Err(err) => {
            tracing::error!("Could not process address: {err}");
            exit(1);
        }
    };

    let state = match ServerState::from_config(&config) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("Could not set up upstream: {err}");
            exit(1);
        }
    };

    let listener = match TcpListener::bind(address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("Could not listen on address {address}: {err}");
            exit(1);
        }
    };

    tracing::info!("mediaproxy {} is starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Streaming from {} on http://{address}", config.media_source());

    if let Some(static_dir) = &config.static_dir {
        tracing::info!("Serving frontend from {static_dir:?}");
    }

    axum::serve(
        listener,
        app(state, config.static_dir.as_deref()).into_make_service(),
    )
    .with_graceful_shutdown(graceful_shutdown())
    .await?;

    Ok(())
}
