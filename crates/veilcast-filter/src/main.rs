// crates/veilcast-filter/src/main.rs
//
// veilcast-filter: RTMP in → face blur (consent-aware) → RTSP out, with an
// optional VAD-gated transcription path. The supervisor owns construction
// and lifecycle of every worker; this file only parses config, sets up
// logging and the SIGINT hook, and reports the exit.

mod config;
mod consent;
mod mask;
mod models;
mod supervisor;
mod workers;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use veilcast_core::state::Shutdown;

use crate::config::Args;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "veilcast-filter starting");

    veilcast_media::init().context("media init")?;

    let config = args.into_config();
    tracing::debug!(?config, "effective configuration");

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("SIGINT received, shutting down");
            shutdown.trigger();
        })
        .context("install SIGINT handler")?;
    }

    supervisor::run(config, shutdown)?;

    tracing::info!("shutdown complete");
    Ok(())
}
