//! Music player: the producer/consumer glue around the streamer.
//!
//! Tracks are downloaded in the background, decoded by a spawned ffmpeg
//! process and paced out by an [`AudioStreamer`]. Every started track gets a
//! new session number; download and stream completions carry the session they
//! belong to so that late events from a replaced stream are ignored.

use crate::{
    config::PlayerConfig,
    event::{EventBus, Subscriber},
    extractor::{download_with_retries, Extractor},
    ffmpeg::{AudioFilter, FfmpegOptions, SourceFactory, MAX_SPEED, MIN_SPEED},
    message::{fmt_duration, MessageAction, NowPlayingInfo, RichContent},
    playlist::{LoopMode, Playlist, Song},
    sink::SinkFactory,
    streamer::{AudioStreamer, StreamEnd, StreamState, StreamerConfig},
    volume::clamp_volume,
};
use anyhow::{bail, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};

/// A stream that ends before this much audio was played is treated as a broken download
pub const BROKEN_STREAM_THRESHOLD: Duration = Duration::from_secs(1);

/// Upcoming songs shown in queue listings
const QUEUE_PAGE_SIZE: usize = 10;

#[derive(Clone, Debug)]
pub enum PlaybackAction {
    /// Resolve a URL or search terms and enqueue the result
    Request { query: String, queued_by: String },

    /// Add song at the end of the queue
    Enqueue { song: Song },

    /// Resumes playback, or starts the queue if nothing is loaded
    Play,

    /// Pauses playback
    Pause,

    /// Play next song
    Skip,

    /// Play previous song
    Prev,

    /// Stop playback and clear the queue
    Stop,

    /// Jump to a position in the current song
    Seek { position: Duration },

    SetSpeed { speed: f64 },

    SetFilter { filter: Option<AudioFilter> },

    SetVolume { volume: f64 },

    SetLoop { mode: LoopMode },

    Shuffle,

    /// Removes song by 1-based queue position, 0 is the current song
    Remove { pos: usize },

    /// Removes latest song queued by user
    RemoveByUser { user: String },

    Move { from: usize, to: usize },

    Clear,

    /// List either the first items in a queue or an item at a specific position
    ListQueue { offset: Option<usize> },

    NowPlaying,

    /// Background download finished
    Downloaded { session: u64, path: PathBuf },

    /// Background download gave up
    DownloadFailed { session: u64, error: String },

    /// Streamer completion callback fired
    StreamEnded { session: u64, end: StreamEnd },
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlayerState {
    pub playlist: Playlist,

    pub volume: f64,

    #[serde(default = "default_speed")]
    pub speed: f64,

    #[serde(default)]
    pub filter: Option<AudioFilter>,

    /// Whether we should start playing if queue empty and a new song is
    /// enqueued
    pub should_play: bool,

    #[serde(skip)]
    /// Whether a song is currently loading or streaming
    pub is_playing: bool,
}

impl PlayerState {
    pub fn new(volume: f64) -> Self {
        Self {
            playlist: Playlist::new(),
            volume: clamp_volume(volume),
            speed: default_speed(),
            filter: None,
            should_play: true,
            is_playing: false,
        }
    }

    pub async fn read_or_default(path: &Path, default_volume: f64) -> Self {
        let res = tokio::fs::read(path).await;

        match res {
            Ok(res) => match serde_json::from_slice(&res) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Corrupt player state in {}: {:?}", path.display(), e);
                    PlayerState::new(default_volume)
                }
            },
            Err(e) => {
                info!("Error while reading player state: {:?}", e);
                info!("Falling back to default state.");
                PlayerState::new(default_volume)
            }
        }
    }
}

/// Serializes state writes so they land on disk in order.
#[derive(Clone)]
struct StateWriter {
    tx: mpsc::UnboundedSender<String>,
}

impl StateWriter {
    fn start(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(json) = rx.recv().await {
                write_atomic(&path, &json).await;
            }
        });

        Self { tx }
    }

    fn write(&self, state: &PlayerState) {
        let json = match serde_json::to_string_pretty(state) {
            Ok(json) => json,
            Err(e) => {
                error!("Error while serializing player state: {:?}", e);
                return;
            }
        };

        if self.tx.send(json).is_err() {
            error!("Player state writer has stopped");
        }
    }
}

/// Write to a temp file first and rename it over the real one, so a crash
/// mid-write never leaves a truncated state file.
async fn write_atomic(path: &Path, json: &str) {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    if let Err(e) = tokio::fs::write(&tmp, json).await {
        error!("Error while writing player state to temp file: {:?}", e);
        return;
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        error!("Error while renaming player state file: {:?}", e);
    }
}

/// External collaborators of the player, swappable in tests
#[derive(Clone)]
pub struct PlayerBackend {
    pub extractor: Arc<dyn Extractor>,
    pub sources: Arc<dyn SourceFactory>,
    pub sinks: SinkFactory,
}

struct ActiveStream {
    streamer: AudioStreamer,
    file: PathBuf,
    /// Track position the current decoder started at
    position_base: Duration,
    /// Streamer frame counter when the current decoder was installed
    frames_base: u64,
    /// Track seconds consumed per second of output
    rate: f64,
    /// Decoder respawns after stream failures
    respawns: u32,
}

impl ActiveStream {
    fn position(&self) -> Duration {
        let frames = self
            .streamer
            .frames_forwarded()
            .saturating_sub(self.frames_base);
        let played = self.streamer.config().duration_of(frames);
        self.position_base + played.mul_f64(self.rate)
    }
}

pub struct MusicPlayer {
    bus: EventBus,
    config: PlayerConfig,
    streamer_config: StreamerConfig,
    backend: PlayerBackend,
    writer: StateWriter,
    pub state: PlayerState,
    session: u64,
    stream: Option<ActiveStream>,
    /// A download for the current session is in flight
    loading: bool,
    /// Re-downloads of the current song after a broken file
    redownloads: u32,
}

/// Type alias for shared player state
pub type SharedPlayer = Arc<RwLock<MusicPlayer>>;

impl MusicPlayer {
    pub async fn create(
        bus: EventBus,
        config: PlayerConfig,
        streamer_config: StreamerConfig,
        backend: PlayerBackend,
    ) -> MusicPlayer {
        let state = PlayerState::read_or_default(&config.state_file, config.default_volume).await;

        debug!("Initial player state:\n{:#?}", state);

        let writer = StateWriter::start(config.state_file.clone());

        let mut player = MusicPlayer {
            bus,
            config,
            streamer_config,
            backend,
            writer,
            state,
            session: 0,
            stream: None,
            loading: false,
            redownloads: 0,
        };

        if player.state.should_play {
            if player.state.playlist.current.is_some() {
                player.start_current();
            } else if !player.state.playlist.upcoming.is_empty() {
                player.state.playlist.skip();
                player.start_current();
            }
        }

        player
    }

    fn persist(&self) {
        self.writer.write(&self.state);
    }

    /// Convenience method for sending messages to all platforms
    fn say(&self, msg: &str) {
        self.bus.say(msg);
    }

    /// Convenience method for sending rich messages to all platforms
    fn say_rich(&self, text: &str, rich: RichContent) {
        self.bus.send_message(MessageAction::rich(text, rich));
    }

    fn say_error(&self, msg: &str) {
        self.bus.send_message(MessageAction::error(msg));
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Position in the current song, if one is streaming
    pub fn position(&self) -> Option<Duration> {
        self.stream.as_ref().map(ActiveStream::position)
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        self.stream.as_ref().map(|s| s.streamer.state())
    }

    fn current_options(&self, file: &Path, offset: Duration) -> FfmpegOptions {
        FfmpegOptions::new(file.to_string_lossy())
            .with_offset(offset)
            .with_speed(self.state.speed)
            .with_filter(self.state.filter)
    }

    fn teardown_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.streamer.stop();
        }
    }

    fn time_until_playback_secs(&self) -> u64 {
        let current_remaining = match (&self.state.playlist.current, self.position()) {
            (Some(song), Some(position)) => song.duration.saturating_sub(position.as_secs()),
            (Some(song), None) => song.duration,
            (None, _) => 0,
        };
        current_remaining + self.state.playlist.upcoming_duration()
    }

    fn enqueue(&mut self, song: Song) {
        let time_until_playback = self.time_until_playback_secs();

        let position = match self.state.playlist.enqueue(song.clone()) {
            Ok(position) => position,
            Err(e) => {
                info!("Rejecting duplicate song: {} ({})", song.title, song.id);
                self.say(&e.to_string());
                return;
            }
        };

        info!(
            "Enqueued song: {} ({}) by {}, queue size: {}",
            song.title,
            song.id,
            song.queued_by,
            self.state.playlist.len()
        );

        let msg = format!(
            "Added {} ({}) to the queue at position {} (queued by {}). Time until playback: {}",
            song.title,
            song.url,
            position,
            song.queued_by,
            fmt_duration(time_until_playback)
        );
        self.say_rich(
            &msg,
            RichContent::SongEnqueued {
                song,
                position,
                time_until_playback_secs: time_until_playback,
            },
        );

        if self.state.should_play && self.state.playlist.current.is_none() {
            self.state.playlist.skip();
            self.start_current();
        }

        self.persist();
    }

    /// Start a fresh session for `playlist.current`, downloading it first.
    fn start_current(&mut self) {
        self.teardown_stream();
        self.session += 1;
        self.redownloads = 0;

        let Some(song) = self.state.playlist.current.clone() else {
            self.end_of_queue();
            return;
        };

        info!(
            "Loading song: {} ({}) - duration: {}",
            song.title,
            song.id,
            fmt_duration(song.duration)
        );

        self.state.is_playing = self.state.should_play;
        self.spawn_download(song, None);
        self.persist();
    }

    /// Download `song` in the background, deleting `stale_file` first so the
    /// extractor's cache can't hand it back.
    fn spawn_download(&mut self, song: Song, stale_file: Option<PathBuf>) {
        self.loading = true;

        let session = self.session;
        let bus = self.bus.clone();
        let extractor = self.backend.extractor.clone();
        let dir = self.config.download_dir.clone();
        let retries = self.config.download_retries;
        let timeout = self.config.download_timeout();
        let backoff = self.config.download_backoff();

        tokio::spawn(async move {
            if let Some(file) = stale_file {
                if let Err(e) = tokio::fs::remove_file(&file).await {
                    debug!("Could not remove broken download {}: {e}", file.display());
                }
            }

            let result =
                download_with_retries(&*extractor, &song, &dir, retries, timeout, backoff).await;

            let action = match result {
                Ok(path) => PlaybackAction::Downloaded { session, path },
                Err(e) => PlaybackAction::DownloadFailed {
                    session,
                    error: format!("{e:#}"),
                },
            };
            bus.send_playback(action);
        });
    }

    fn new_streamer(&self, file: &Path, offset: Duration) -> Result<AudioStreamer> {
        let options = self.current_options(file, offset);
        let source = self.backend.sources.open(&options)?;

        let bus = self.bus.clone();
        let session = self.session;
        let streamer = AudioStreamer::new(
            source,
            (self.backend.sinks)(),
            self.streamer_config,
            Box::new(move |end| {
                bus.send_playback(PlaybackAction::StreamEnded { session, end });
            }),
        );
        streamer.set_volume(self.state.volume);

        if self.state.should_play {
            streamer.start()?;
        }

        Ok(streamer)
    }

    /// Begin streaming `file` from `offset` in the current session
    fn begin_stream(&mut self, file: PathBuf, offset: Duration, respawns: u32) -> Result<()> {
        let streamer = self.new_streamer(&file, offset)?;
        let rate = self.current_options(&file, offset).playback_rate();

        self.stream = Some(ActiveStream {
            streamer,
            file,
            position_base: offset,
            frames_base: 0,
            rate,
            respawns,
        });
        Ok(())
    }

    fn on_downloaded(&mut self, session: u64, path: PathBuf) {
        if session != self.session {
            debug!("Ignoring download for stale session {session}");
            return;
        }
        self.loading = false;

        let Some(song) = self.state.playlist.current.clone() else {
            return;
        };

        if let Err(e) = self.begin_stream(path, Duration::ZERO, 0) {
            error!("Failed to start playback of {}: {:#}", song.id, e);
            self.say_error(&format!(
                "Failed to start playback of {}: {e:#}. Skipping.",
                song.title
            ));
            self.skip_broken();
            return;
        }

        info!("Playing song: {} ({})", song.title, song.id);

        let info = NowPlayingInfo {
            song: song.clone(),
            progress_secs: 0,
            is_playing: self.state.should_play,
            speed: self.state.speed,
            filter: self.state.filter,
        };
        self.say_rich(
            &format!(
                "Now playing: {} ({}) [{}], queued by {}",
                song.title,
                song.url,
                fmt_duration(song.duration),
                song.queued_by
            ),
            RichContent::NowPlaying { info },
        );
    }

    fn on_download_failed(&mut self, session: u64, error: String) {
        if session != self.session {
            debug!("Ignoring download failure for stale session {session}");
            return;
        }
        self.loading = false;

        let title = self
            .state
            .playlist
            .current
            .as_ref()
            .map(|s| s.title.clone())
            .unwrap_or_default();
        error!("Download of {title} failed: {error}");
        self.say_error(&format!("Failed to download {title}: {error}. Skipping."));
        self.skip_broken();
    }

    fn on_stream_ended(&mut self, session: u64, end: StreamEnd) {
        if session != self.session {
            debug!("Ignoring {:?} for stale session {session}", end);
            return;
        }

        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let position = stream.position();
        let played = stream.streamer.elapsed();
        let from_start = stream.position_base.is_zero();
        let respawns = stream.respawns;
        let file = stream.file.clone();

        match end {
            StreamEnd::Stopped => {}
            StreamEnd::Finished if from_start && played < BROKEN_STREAM_THRESHOLD => {
                self.retry_broken_file(file);
            }
            StreamEnd::Finished => {
                let title = self
                    .state
                    .playlist
                    .current
                    .as_ref()
                    .map(|s| s.title.clone())
                    .unwrap_or_default();
                info!("Finished song: {title} at {}", fmt_duration(position.as_secs()));
                self.stream = None;
                self.state.playlist.advance();
                self.start_current();
            }
            StreamEnd::Failed(reason) if respawns < self.config.stream_retries => {
                warn!(
                    "Stream failed at {} ({reason}), respawning decoder ({}/{})",
                    fmt_duration(position.as_secs()),
                    respawns + 1,
                    self.config.stream_retries
                );
                self.teardown_stream();
                self.session += 1;
                if let Err(e) = self.begin_stream(file, position, respawns + 1) {
                    error!("Failed to respawn decoder: {:#}", e);
                    self.say_error(&format!("Playback failed: {e:#}. Skipping."));
                    self.skip_broken();
                }
            }
            StreamEnd::Failed(reason) => {
                error!("Stream failed again ({reason}), giving up on this song");
                self.say_error(&format!("Playback failed: {reason}. Skipping."));
                self.skip_broken();
            }
        }
    }

    /// The decoder produced (almost) nothing: drop the cached file and download again.
    fn retry_broken_file(&mut self, file: PathBuf) {
        self.teardown_stream();

        let Some(song) = self.state.playlist.current.clone() else {
            return;
        };

        if self.redownloads >= self.config.download_retries {
            error!("{} is still unplayable after re-downloading, skipping", song.id);
            self.say_error(&format!("Could not play {}. Skipping.", song.title));
            self.skip_broken();
            return;
        }

        self.redownloads += 1;
        warn!(
            "{} ended immediately, re-downloading ({}/{})",
            song.id, self.redownloads, self.config.download_retries
        );

        self.session += 1;
        self.spawn_download(song, Some(file));
    }

    /// Skip the current song without recording it as played
    fn skip_broken(&mut self) {
        self.teardown_stream();
        if let Some(song) = self.state.playlist.discard_current() {
            info!("Skipped broken song: {} ({})", song.title, song.id);
        }
        self.start_current();
    }

    fn end_of_queue(&mut self) {
        info!(
            "Playback queue ended, {} songs in history",
            self.state.playlist.history.len()
        );

        self.teardown_stream();
        self.loading = false;
        self.state.is_playing = false;

        self.say("Playback queue ended.");
        self.persist()
    }

    fn play(&mut self) {
        info!("Playback resumed");
        self.state.should_play = true;

        if let Some(stream) = &self.stream {
            let resumed = match stream.streamer.state() {
                StreamState::Idle => stream.streamer.start().map(|_| true),
                _ => Ok(stream.streamer.resume()),
            };
            match resumed {
                Ok(_) => self.state.is_playing = true,
                Err(e) => {
                    error!("Failed to start stream: {:#}", e);
                    self.skip_broken();
                }
            }
        } else if self.loading {
            self.state.is_playing = true;
        } else if self.state.playlist.current.is_some() {
            self.start_current();
        } else if !self.state.playlist.upcoming.is_empty() {
            self.state.playlist.skip();
            self.start_current();
        } else {
            self.say("Queue is empty!");
        }

        self.persist();
    }

    fn pause(&mut self) {
        info!("Playback paused");
        self.state.should_play = false;
        self.state.is_playing = false;

        if let Some(stream) = &self.stream {
            stream.streamer.pause();
        }

        self.persist();
    }

    fn skip(&mut self) {
        match self.state.playlist.current.clone() {
            Some(song) => {
                info!("Skipped song: {} ({})", song.title, song.id);
                self.say(&format!("Skipping {}", song.title));
                self.state.playlist.skip();
                self.start_current();
            }
            None => self.say("Nothing is playing"),
        }
    }

    fn prev(&mut self) {
        match self.state.playlist.previous() {
            Some(song) => {
                info!("Going back to previous song: {} ({})", song.title, song.id);
                self.start_current();
            }
            None => {
                info!("No previous song available");
                self.say("No previous song");
            }
        }
    }

    fn stop(&mut self) {
        info!("Playback stopped, clearing queue");
        self.teardown_stream();
        self.session += 1;
        self.loading = false;
        self.state.playlist.current = None;
        self.state.playlist.clear();
        self.state.is_playing = false;
        self.say("Stopped playback and cleared the queue.");
        self.persist();
    }

    /// Swap the decoder for one starting at `position` with the given speed
    /// and filter, keeping the streamer's frame counter continuous.
    fn reload_source(
        &mut self,
        position: Duration,
        speed: f64,
        filter: Option<AudioFilter>,
    ) -> Result<()> {
        let Some(file) = self.stream.as_ref().map(|s| s.file.clone()) else {
            bail!("Nothing is playing");
        };

        let options = FfmpegOptions::new(file.to_string_lossy())
            .with_offset(position)
            .with_speed(speed)
            .with_filter(filter);
        let source = self
            .backend
            .sources
            .open(&options)
            .context("Failed to restart decoder")?;

        let stream = self.stream.as_mut().context("Nothing is playing")?;
        let frames = stream.streamer.replace_source(source, None)?;
        stream.position_base = position;
        stream.frames_base = frames;
        stream.rate = options.playback_rate();

        Ok(())
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let Some(song) = self.state.playlist.current.clone() else {
            bail!("Nothing is playing");
        };
        if self.stream.is_none() {
            bail!("{} is still loading", song.title);
        }
        if position.as_secs() >= song.duration {
            bail!(
                "Cannot seek past the end of {} ({})",
                song.title,
                fmt_duration(song.duration)
            );
        }

        self.reload_source(position, self.state.speed, self.state.filter)?;
        info!("Seeked {} to {}", song.id, fmt_duration(position.as_secs()));
        self.say(&format!("Seeked to {}", fmt_duration(position.as_secs())));
        Ok(())
    }

    fn set_speed(&mut self, speed: f64) -> Result<()> {
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            bail!("Speed must be between {MIN_SPEED} and {MAX_SPEED}");
        }

        // Only commit once the decoder runs with the new speed
        if let Some(position) = self.position() {
            self.reload_source(position, speed, self.state.filter)?;
        }
        self.state.speed = speed;

        self.say(&format!("Playback speed set to {speed}x"));
        self.persist();
        Ok(())
    }

    fn set_filter(&mut self, filter: Option<AudioFilter>) -> Result<()> {
        if let Some(position) = self.position() {
            self.reload_source(position, self.state.speed, filter)?;
        }
        self.state.filter = filter;

        match filter {
            Some(filter) => self.say(&format!("Filter set to {filter}")),
            None => self.say("Filter cleared"),
        }
        self.persist();
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) {
        self.state.volume = clamp_volume(volume);
        if let Some(stream) = &self.stream {
            stream.streamer.set_volume(self.state.volume);
        }
        self.say(&format!(
            "Volume set to {}%",
            (self.state.volume * 100.0).round()
        ));
        self.persist();
    }

    fn remove_at(&mut self, pos: usize) {
        let song = if pos == 0 {
            let song = self.state.playlist.current.clone();
            if song.is_some() {
                self.state.playlist.skip();
                self.start_current();
            }
            song
        } else {
            self.state.playlist.remove(pos)
        };

        match song {
            Some(song) => self.say_rich(
                &format!("Removed song {} from the queue", song.title),
                RichContent::SongRemoved { title: song.title },
            ),
            None => self.say(&format!("No song at position {pos} in the queue")),
        }
        self.persist();
    }

    fn remove_by_user(&mut self, user: String) {
        let song = match self.state.playlist.remove_latest_by(&user) {
            Some(song) => Some(song),
            None => {
                let current_by_user = self
                    .state
                    .playlist
                    .current
                    .as_ref()
                    .is_some_and(|s| s.queued_by == user);
                if current_by_user {
                    let song = self.state.playlist.current.clone();
                    self.state.playlist.skip();
                    self.start_current();
                    song
                } else {
                    None
                }
            }
        };

        match song {
            Some(song) => self.say_rich(
                &format!("Removed song {} from the queue", song.title),
                RichContent::SongRemoved { title: song.title },
            ),
            None => self.say(&format!("No songs queued by {user}")),
        }
        self.persist();
    }

    fn list_queue(&self, offset: Option<usize>) {
        let fmt_song = |song: Option<&Song>| {
            song.map(|song| {
                format!(
                    "{} ({}, queued by {})",
                    song.title, song.url, song.queued_by
                )
            })
            .unwrap_or_else(|| "(nothing)".to_string())
        };

        let playlist = &self.state.playlist;

        if playlist.is_empty() {
            self.say("Queue is empty!");
            return;
        }

        if let Some(offset) = offset {
            let song = if offset == 0 {
                playlist.current.as_ref()
            } else {
                playlist.upcoming.get(offset - 1)
            };
            self.say(&format!("Song at position {offset}: {}", fmt_song(song)));
            return;
        }

        let state = if self.state.is_playing {
            "Now playing"
        } else {
            "Paused"
        };
        let progress = self.position().unwrap_or_default().as_secs();
        let np = playlist.current.as_ref();
        let np_duration = np.map(|song| song.duration).unwrap_or_default();
        let upcoming = playlist.page(0, QUEUE_PAGE_SIZE);
        let next_up = if upcoming.is_empty() {
            "(nothing)".to_string()
        } else {
            upcoming
                .iter()
                .map(|(pos, song)| format!("{pos}. {}", song.title))
                .join(", ")
        };

        let msg = format!(
            "{state} ({}/{}): {}, next up: {next_up}. Queue length: {} songs ({}), loop: {}",
            fmt_duration(progress),
            fmt_duration(np_duration),
            fmt_song(np),
            playlist.len(),
            fmt_duration(playlist.upcoming_duration()),
            playlist.loop_mode
        );

        let now_playing = np.cloned().map(|song| NowPlayingInfo {
            song,
            progress_secs: progress,
            is_playing: self.state.is_playing,
            speed: self.state.speed,
            filter: self.state.filter,
        });

        self.say_rich(
            &msg,
            RichContent::QueueStatus {
                now_playing,
                upcoming: upcoming.into_iter().map(|(_, s)| s.clone()).collect(),
                queue_length: playlist.len(),
                queue_duration_secs: playlist.upcoming_duration(),
                loop_mode: playlist.loop_mode,
            },
        );
    }

    fn now_playing(&self) {
        let Some(song) = self.state.playlist.current.clone() else {
            self.say("Nothing is playing");
            return;
        };

        let progress = self.position().unwrap_or_default().as_secs();
        let status = if self.loading {
            "Loading"
        } else if self.state.is_playing {
            "Now playing"
        } else {
            "Paused"
        };

        let info = NowPlayingInfo {
            song: song.clone(),
            progress_secs: progress,
            is_playing: self.state.is_playing,
            speed: self.state.speed,
            filter: self.state.filter,
        };
        self.say_rich(
            &format!(
                "{status}: {} ({}/{}), queued by {}",
                song.title,
                fmt_duration(progress),
                fmt_duration(song.duration),
                song.queued_by
            ),
            RichContent::NowPlaying { info },
        );
    }

    fn request(&self, query: String, queued_by: String) {
        let bus = self.bus.clone();
        let extractor = self.backend.extractor.clone();
        let max_duration = self.config.max_song_duration();

        tokio::spawn(async move {
            match extractor.resolve(&query, &queued_by).await {
                Ok(song) if song.duration > max_duration.as_secs() => {
                    info!("Rejecting {} ({}s): too long", song.id, song.duration);
                    bus.send_message(MessageAction::error(format!(
                        "{} is too long ({}), the limit is {}",
                        song.title,
                        fmt_duration(song.duration),
                        fmt_duration(max_duration.as_secs())
                    )));
                }
                Ok(song) => bus.send_playback(PlaybackAction::Enqueue { song }),
                Err(e) => {
                    warn!("Could not resolve {query}: {:#}", e);
                    bus.send_message(MessageAction::error(format!(
                        "Could not find anything for \"{query}\""
                    )));
                }
            }
        });
    }

    pub fn handle(&mut self, action: PlaybackAction) {
        let result = match action {
            PlaybackAction::Request { query, queued_by } => {
                self.request(query, queued_by);
                Ok(())
            }
            PlaybackAction::Enqueue { song } => {
                self.enqueue(song);
                Ok(())
            }
            PlaybackAction::Play => {
                self.play();
                Ok(())
            }
            PlaybackAction::Pause => {
                self.pause();
                Ok(())
            }
            PlaybackAction::Skip => {
                self.skip();
                Ok(())
            }
            PlaybackAction::Prev => {
                self.prev();
                Ok(())
            }
            PlaybackAction::Stop => {
                self.stop();
                Ok(())
            }
            PlaybackAction::Seek { position } => self.seek(position),
            PlaybackAction::SetSpeed { speed } => self.set_speed(speed),
            PlaybackAction::SetFilter { filter } => self.set_filter(filter),
            PlaybackAction::SetVolume { volume } => {
                self.set_volume(volume);
                Ok(())
            }
            PlaybackAction::SetLoop { mode } => {
                self.state.playlist.loop_mode = mode;
                self.say(&format!("Loop mode set to {mode}"));
                self.persist();
                Ok(())
            }
            PlaybackAction::Shuffle => {
                self.state.playlist.shuffle();
                self.say(&format!("Shuffled {} songs", self.state.playlist.len()));
                self.persist();
                Ok(())
            }
            PlaybackAction::Remove { pos } => {
                self.remove_at(pos);
                Ok(())
            }
            PlaybackAction::RemoveByUser { user } => {
                self.remove_by_user(user);
                Ok(())
            }
            PlaybackAction::Move { from, to } => {
                let moved = self
                    .state
                    .playlist
                    .move_song(from, to)
                    .map(|song| song.title.clone());
                moved.map(|title| {
                    self.say(&format!("Moved {title} to position {to}"));
                    self.persist();
                })
            }
            PlaybackAction::Clear => {
                let count = self.state.playlist.clear();
                self.say(&format!("Cleared {count} songs from the queue"));
                self.persist();
                Ok(())
            }
            PlaybackAction::ListQueue { offset } => {
                self.list_queue(offset);
                Ok(())
            }
            PlaybackAction::NowPlaying => {
                self.now_playing();
                Ok(())
            }
            PlaybackAction::Downloaded { session, path } => {
                self.on_downloaded(session, path);
                Ok(())
            }
            PlaybackAction::DownloadFailed { session, error } => {
                self.on_download_failed(session, error);
                Ok(())
            }
            PlaybackAction::StreamEnded { session, end } => {
                self.on_stream_ended(session, end);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Playback command failed: {:#}", e);
            self.say_error(&format!("{e:#}"));
        }
    }
}

pub async fn init(
    bus: &EventBus,
    config: PlayerConfig,
    streamer_config: StreamerConfig,
    backend: PlayerBackend,
) -> SharedPlayer {
    // Subscribe before creating the player so no startup event is missed
    let subscriber = bus.subscribe();
    let player = MusicPlayer::create(bus.clone(), config, streamer_config, backend).await;
    let player = Arc::new(RwLock::new(player));

    handle_incoming_event_loop(subscriber, player.clone());

    player
}

fn handle_incoming_event_loop(mut bus_rx: Subscriber, player: SharedPlayer) {
    tokio::spawn(async move {
        loop {
            let action = bus_rx.recv_playback().await;
            let mut player = player.write().await;
            player.handle(action);
        }
    });
}
