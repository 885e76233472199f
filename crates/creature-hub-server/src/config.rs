//! Server configuration schema and loading (TOML, following the workspace's
//! usual `serde` + `anyhow::Context` pattern).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use creature_types::AudioMode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// HTTP control-plane bind address.
    pub bind: Option<String>,
    /// Event loop tick period in milliseconds. Defaults to 1 (1kHz).
    pub ms_per_tick: Option<u32>,
    /// Directory sound files referenced by `Animation.sound_file` resolve
    /// against.
    pub sound_file_location: Option<String>,
    /// Path to a JSON file of creature records. Stands in for whatever
    /// record store actually owns creature data in a full deployment.
    pub creature_source_file: Option<String>,
    /// Optional directory for the audio stream buffer's disk cache. Absence
    /// disables the cache; it is otherwise invisible to callers either way.
    pub audio_cache_dir: Option<String>,
    #[serde(default)]
    pub audio_mode: AudioModeConfig,
    pub rtp: Option<RtpConfig>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioModeConfig {
    #[default]
    Local,
    Rtp,
}

impl From<AudioModeConfig> for AudioMode {
    fn from(value: AudioModeConfig) -> Self {
        match value {
            AudioModeConfig::Local => AudioMode::Local,
            AudioModeConfig::Rtp => AudioMode::Rtp,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RtpConfig {
    pub bind: String,
    /// Exactly 17 UDP destinations, one per independent mono stream.
    pub targets: Vec<String>,
    /// Number of silent frames to prime receivers with on encoder reset.
    #[serde(default = "default_silent_frame_count")]
    pub silent_frame_count: u8,
}

fn default_silent_frame_count() -> u8 {
    4
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {path:?}"))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {path:?}"))
    }

    pub fn ms_per_tick(&self) -> u32 {
        self.ms_per_tick.unwrap_or(1)
    }

    pub fn sound_file_location(&self) -> PathBuf {
        PathBuf::from(self.sound_file_location.as_deref().unwrap_or("./sounds"))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let bind = self.bind.as_deref().unwrap_or("0.0.0.0:8080");
        bind.parse().with_context(|| format!("parsing bind address {bind}"))
    }
}
