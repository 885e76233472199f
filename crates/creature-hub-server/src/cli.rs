//! Command-line interface definitions.
//!
//! This module contains the `clap`-powered CLI surface area (args + defaults).
//! It intentionally has no server logic so the rest of the crate can stay
//! reusable from tests and other entry points.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
pub struct Args {
    /// Path to a TOML config file
    #[arg(long, short = 'c', default_value = "creature-hub-server.toml")]
    pub config: PathBuf,

    /// Override the HTTP bind address from the config file
    #[arg(long)]
    pub bind: Option<String>,

    /// Log filter, e.g. "info" or "creature_hub_server=debug"
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
