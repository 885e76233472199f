//! creature-hub-server — the real-time control plane for a creature
//! workshop: a fixed-tick cooperative event loop driving DMX and audio
//! playback, fronted by a thin HTTP scheduling API.
//!
//! ## Pipeline
//! 1. **Schedule**: the HTTP API validates an animation and hands it to the
//!    [`scheduler`] to become a running [`session::PlaybackSession`].
//! 2. **Tick**: the [`eventloop`] advances a fixed-period frame counter and
//!    fires whatever is due, including the per-animation [`runner`].
//! 3. **Emit**: each firing pushes DMX frames and, when present, audio —
//!    either over RTP ([`audio::rtp_control`]) or to a local device
//!    ([`audio::transport`]).

mod api;
mod audio;
mod cli;
mod config;
mod context;
mod creature_cache;
mod dmx;
mod event;
mod eventloop;
mod metrics;
mod observability;
mod runner;
mod scheduler;
mod session;
mod session_registry;
mod startup;
mod status_light;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = config::ServerConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.bind = Some(bind);
    }

    startup::run(config).await
}
