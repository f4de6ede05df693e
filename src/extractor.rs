//! yt-dlp integration: resolving queries to songs and downloading their audio.

use crate::playlist::Song;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::AsyncBufReadExt;
use youtube_dl::{download_yt_dlp, YoutubeDl};

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Look up a URL or search terms
    async fn resolve(&self, query: &str, queued_by: &str) -> Result<Song>;

    /// Download the song's audio into `dir` and return the file path
    async fn download(&self, song: &Song, dir: &Path) -> Result<PathBuf>;
}

pub async fn init(ytdlp_path: &str) -> Result<()> {
    let path = PathBuf::from(ytdlp_path);
    let exists = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || path.exists()).await?
    };

    if !exists {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        info!("Downloading yt-dlp binary into {}", dir.display());
        download_yt_dlp(dir).await?;
    }

    Ok(())
}

pub struct YtDlp {
    ytdlp_path: String,
}

impl YtDlp {
    pub fn new(ytdlp_path: impl Into<String>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
        }
    }
}

/// Finds a previously downloaded file for `id` in `dir`
async fn find_cached(dir: &Path, id: &str) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let prefix = format!("{id}.");

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && !name.ends_with(".part") {
            return Some(entry.path());
        }
    }
    None
}

#[async_trait]
impl Extractor for YtDlp {
    async fn resolve(&self, query: &str, queued_by: &str) -> Result<Song> {
        let output = YoutubeDl::new(query)
            .youtube_dl_path(&self.ytdlp_path)
            .extract_audio(true)
            .extra_arg("--default-search")
            .extra_arg("ytsearch")
            .extra_arg("--no-playlist")
            .run_async()
            .await?;

        let single_video = output.clone().into_single_video();
        let first_match = single_video.or_else(|| {
            let playlist = output.into_playlist()?;
            let entries = playlist.entries?;
            entries.first().cloned()
        });

        let video = first_match.context("No video found")?;
        let id = video.id;
        let url = video
            .webpage_url
            .unwrap_or_else(|| format!("https://youtu.be/{}", id));
        let title = video.title.context("No title found in yt-dlp JSON!")?;
        let channel = video.channel.unwrap_or_else(|| "Unknown".to_string());
        let duration = video
            .duration
            .context("No duration found in yt-dlp JSON!")?
            .as_f64()
            .context("Invalid duration in yt-dlp JSON")?;

        Ok(Song {
            id,
            url,
            title,
            channel,
            duration: duration.round() as u64,
            queued_by: queued_by.to_string(),
        })
    }

    async fn download(&self, song: &Song, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        if let Some(path) = find_cached(dir, &song.id).await {
            debug!("Using cached download {}", path.display());
            return Ok(path);
        }

        let template = dir.join("%(id)s.%(ext)s");
        let mut cmd = tokio::process::Command::new(&self.ytdlp_path)
            .arg(&song.url)
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg("-x")
            .arg("-o")
            .arg(&template)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.ytdlp_path))?;

        let stderr = cmd.stderr.take().context("Failed to get yt-dlp stderr")?;
        let stderr_task = tokio::spawn(async move {
            // Keep the tail for error reporting, log the rest
            let mut reader = tokio::io::BufReader::new(stderr).lines();
            let mut last = String::new();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("yt-dlp stderr: {}", line);
                last = line;
            }
            last
        });

        let status = cmd.wait().await?;
        let last_line = stderr_task.await.unwrap_or_default();

        if !status.success() {
            bail!(
                "yt-dlp failed (exit code {code}): {last_line}",
                code = status.code().unwrap_or_default()
            );
        }

        find_cached(dir, &song.id)
            .await
            .with_context(|| format!("yt-dlp finished but no file found for {}", song.id))
    }
}

/// Download with a timeout per attempt and up to `retries` extra attempts,
/// waiting `backoff × attempt` between them.
pub async fn download_with_retries(
    extractor: &dyn Extractor,
    song: &Song,
    dir: &Path,
    retries: u32,
    timeout: Duration,
    backoff: Duration,
) -> Result<PathBuf> {
    let mut last_error = anyhow!("No download attempted");

    for attempt in 0..=retries {
        if attempt > 0 {
            let backoff = backoff * attempt;
            info!(
                "Retrying download of {} ({}/{retries}) in {:?}",
                song.id, attempt, backoff
            );
            tokio::time::sleep(backoff).await;
        }

        match tokio::time::timeout(timeout, extractor.download(song, dir)).await {
            Ok(Ok(path)) => return Ok(path),
            Ok(Err(e)) => {
                warn!("Download of {} failed: {:#}", song.id, e);
                last_error = e;
            }
            Err(_) => {
                warn!("Download of {} timed out after {:?}", song.id, timeout);
                last_error = anyhow!("Download timed out after {:?}", timeout);
            }
        }
    }

    Err(last_error.context(format!("Giving up on {} after {} attempts", song.id, retries + 1)))
}
