use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tokio::fs::read_to_string;

pub const CONFIG_FILE: &str = "Config.toml";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_path: String,

    /// Path to the yt-dlp binary, downloaded on startup if missing
    pub ytdlp_path: String,

    /// Where downloaded tracks are cached
    pub download_dir: PathBuf,

    /// Where the queue is persisted between restarts
    pub state_file: PathBuf,

    /// Initial volume, 1.0 = unchanged
    pub default_volume: f64,

    /// Download attempts per track after the first one fails
    pub download_retries: u32,

    /// Per-attempt download timeout in seconds
    pub download_timeout_secs: u64,

    /// Wait before retry `n` is `n ×` this many milliseconds
    pub download_backoff_ms: u64,

    /// Decoder respawns allowed per track after a mid-stream failure
    pub stream_retries: u32,

    /// Longest track accepted by requests, in seconds
    pub max_song_duration_secs: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "./yt-dlp".to_string(),
            download_dir: PathBuf::from("downloads"),
            state_file: PathBuf::from("player_state.json"),
            default_volume: 0.5,
            download_retries: 3,
            download_timeout_secs: 120,
            download_backoff_ms: 2000,
            stream_retries: 2,
            max_song_duration_secs: 10 * 60,
        }
    }
}

impl PlayerConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn download_backoff(&self) -> Duration {
        Duration::from_millis(self.download_backoff_ms)
    }

    pub fn max_song_duration(&self) -> Duration {
        Duration::from_secs(self.max_song_duration_secs)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NetConfig {
    /// Address for the WAV-over-TCP listener, disabled when unset
    pub listen_addr: Option<String>,
}

#[cfg(feature = "discord")]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscordConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Text channel ID for commands and announcements
    pub discord_channel_id: u64,

    /// Guild (server) ID for registering slash commands
    pub discord_guild_id: u64,

    /// Voice channel to join on startup
    pub discord_voice_channel_id: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub player: PlayerConfig,

    #[serde(default)]
    pub net: NetConfig,

    #[cfg(feature = "discord")]
    pub discord: Option<DiscordConfig>,
}

pub fn from_str(s: &str) -> Result<Config> {
    let config: Config = toml::from_str(s).context("Invalid configuration")?;
    Ok(config)
}

pub async fn load() -> Result<Config> {
    let config = read_to_string(CONFIG_FILE)
        .await
        .with_context(|| format!("Failed to read {CONFIG_FILE}"))?;

    from_str(&config)
}
