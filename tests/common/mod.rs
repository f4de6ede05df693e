//! Test infrastructure for voice-streamer-rs integration tests.
//!
//! Provides mocking utilities, test harnesses, and helper functions
//! for testing the player without yt-dlp, ffmpeg or a network.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

// Re-export key types from the main crate
pub use voice_streamer_rs::config::PlayerConfig;
pub use voice_streamer_rs::event::{Event, EventBus, Subscriber};
pub use voice_streamer_rs::extractor::Extractor;
pub use voice_streamer_rs::ffmpeg::{AudioFilter, FfmpegOptions, SourceFactory};
pub use voice_streamer_rs::message::{MessageAction, RichContent};
pub use voice_streamer_rs::player::{
    self, MusicPlayer, PlaybackAction, PlayerBackend, PlayerState, SharedPlayer,
};
pub use voice_streamer_rs::playlist::{LoopMode, Playlist, Song};
pub use voice_streamer_rs::sink::{FrameSink, SinkFactory};
pub use voice_streamer_rs::source::{PcmSource, ReaderSource};
pub use voice_streamer_rs::streamer::{StreamEnd, StreamState, StreamerConfig};

/// Bytes per frame in tests, small enough to keep the fake downloads tiny
pub const TEST_FRAME_SIZE: usize = 16;

/// Frames per second of audio at the test frame duration
pub const FRAMES_PER_SEC: usize = 50;

pub fn test_streamer_config() -> StreamerConfig {
    StreamerConfig {
        frame_size: TEST_FRAME_SIZE,
        frame_duration: Duration::from_millis(20),
    }
}

/// Creates a player configuration that keeps all files in `dir`.
pub fn test_player_config(dir: &Path) -> PlayerConfig {
    PlayerConfig {
        download_dir: dir.join("downloads"),
        state_file: dir.join("player_state.json"),
        default_volume: 1.0,
        download_retries: 1,
        download_timeout_secs: 5,
        download_backoff_ms: 10,
        stream_retries: 1,
        ..PlayerConfig::default()
    }
}

/// Creates a mock Song for testing.
pub fn mock_song(id: &str, title: &str, queued_by: &str) -> Song {
    mock_song_with_duration(id, title, queued_by, 180)
}

/// Creates a mock Song with custom duration for testing.
pub fn mock_song_with_duration(id: &str, title: &str, queued_by: &str, duration_secs: u64) -> Song {
    Song {
        id: id.to_string(),
        url: format!("https://youtu.be/{id}"),
        title: title.to_string(),
        channel: "Test Channel".to_string(),
        duration: duration_secs,
        queued_by: queued_by.to_string(),
    }
}

/// Extractor that "downloads" by writing `frames` frames of PCM into the download dir.
#[derive(Default)]
pub struct MockExtractor {
    songs: Mutex<HashMap<String, Song>>,
    frames: Mutex<HashMap<String, usize>>,
    failing: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a song that `resolve(query)` returns and how many frames its file has
    pub fn with_song(self, query: &str, song: Song, frames: usize) -> Self {
        self.frames.lock().unwrap().insert(song.id.clone(), frames);
        self.songs.lock().unwrap().insert(query.to_string(), song);
        self
    }

    /// Set the length of the file downloaded for `id`
    pub fn with_frames(self, id: &str, frames: usize) -> Self {
        self.frames.lock().unwrap().insert(id.to_string(), frames);
        self
    }

    /// Every download of `id` fails
    pub fn failing(self, id: &str) -> Self {
        self.failing.lock().unwrap().push(id.to_string());
        self
    }

    /// Ids of every download attempt, in order
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn download_count(&self, id: &str) -> usize {
        self.downloads().iter().filter(|d| *d == id).count()
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn resolve(&self, query: &str, queued_by: &str) -> Result<Song> {
        let song = self.songs.lock().unwrap().get(query).cloned();
        let mut song = song.ok_or_else(|| anyhow!("No video found"))?;
        song.queued_by = queued_by.to_string();
        Ok(song)
    }

    async fn download(&self, song: &Song, dir: &Path) -> Result<PathBuf> {
        self.downloads.lock().unwrap().push(song.id.clone());

        if self.failing.lock().unwrap().contains(&song.id) {
            bail!("HTTP Error 403: Forbidden");
        }

        let frames = self
            .frames
            .lock()
            .unwrap()
            .get(&song.id)
            .copied()
            .unwrap_or(FRAMES_PER_SEC * 60);

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.pcm", song.id));
        tokio::fs::write(&path, vec![1u8; frames * TEST_FRAME_SIZE]).await?;
        Ok(path)
    }
}

/// Source that fails after a number of frames
struct FlakySource {
    inner: ReaderSource<Cursor<Vec<u8>>>,
    frames_left: usize,
}

impl PcmSource for FlakySource {
    fn read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.frames_left == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "decoder crashed",
            ));
        }
        self.frames_left -= 1;
        self.inner.read_frame(buf)
    }
}

/// Decoder stand-in: reads the downloaded file and honours the start offset.
#[derive(Default)]
pub struct MemorySourceFactory {
    opened: Mutex<Vec<FfmpegOptions>>,
    /// The next N sources fail after `fail_after` frames
    flaky: Mutex<usize>,
    fail_after: usize,
    /// The next N opens fail outright, as if ffmpeg could not be spawned
    unavailable: Mutex<usize>,
}

impl MemorySourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flaky(count: usize, fail_after: usize) -> Self {
        Self {
            opened: Mutex::new(vec![]),
            flaky: Mutex::new(count),
            fail_after,
            unavailable: Mutex::new(0),
        }
    }

    pub fn fail_next_opens(&self, count: usize) {
        *self.unavailable.lock().unwrap() = count;
    }

    /// Options of every source opened so far
    pub fn opened(&self) -> Vec<FfmpegOptions> {
        self.opened.lock().unwrap().clone()
    }
}

impl SourceFactory for MemorySourceFactory {
    fn open(&self, options: &FfmpegOptions) -> Result<Box<dyn PcmSource>> {
        {
            let mut unavailable = self.unavailable.lock().unwrap();
            if *unavailable > 0 {
                *unavailable -= 1;
                bail!("No such file or directory (os error 2)");
            }
        }
        self.opened.lock().unwrap().push(options.clone());

        let bytes = std::fs::read(&options.input)?;
        let skip_frames = test_streamer_config().frames_in(options.start_offset) as usize;
        let skip = (skip_frames * TEST_FRAME_SIZE).min(bytes.len());
        let inner = ReaderSource::new(Cursor::new(bytes[skip..].to_vec()));

        let mut flaky = self.flaky.lock().unwrap();
        if *flaky > 0 {
            *flaky -= 1;
            return Ok(Box::new(FlakySource {
                inner,
                frames_left: self.fail_after,
            }));
        }

        Ok(Box::new(inner))
    }
}

/// Sink that records every frame it receives
#[derive(Clone, Default)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CollectingSink {
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn factory(&self) -> SinkFactory {
        let sink = self.clone();
        Arc::new(move || Box::new(sink.clone()) as Box<dyn FrameSink>)
    }
}

impl FrameSink for CollectingSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// Test harness that wires a player to mocks and provides test utilities.
pub struct TestHarness {
    pub bus: EventBus,
    pub player: SharedPlayer,
    pub extractor: Arc<MockExtractor>,
    pub sources: Arc<MemorySourceFactory>,
    pub sink: CollectingSink,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    /// Creates a new test harness with default configuration.
    pub async fn new(extractor: MockExtractor) -> Self {
        Self::build(extractor, MemorySourceFactory::new(), |_| {}, None).await
    }

    /// Creates a harness with custom config tweaks, decoder and pre-written state.
    pub async fn build(
        extractor: MockExtractor,
        sources: MemorySourceFactory,
        configure: impl FnOnce(&mut PlayerConfig),
        state: Option<&PlayerState>,
    ) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_player_config(dir.path());
        configure(&mut config);

        if let Some(state) = state {
            let json = serde_json::to_string_pretty(state).unwrap();
            tokio::fs::write(&config.state_file, json).await.unwrap();
        }

        let bus = EventBus::new();
        let extractor = Arc::new(extractor);
        let sources = Arc::new(sources);
        let sink = CollectingSink::default();

        let backend = PlayerBackend {
            extractor: extractor.clone(),
            sources: sources.clone(),
            sinks: sink.factory(),
        };
        let player = player::init(&bus, config, test_streamer_config(), backend).await;

        Self {
            bus,
            player,
            extractor,
            sources,
            sink,
            dir,
        }
    }

    /// Creates a new subscriber for receiving events.
    pub fn subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    /// Sends a playback action.
    pub fn send_playback(&self, action: PlaybackAction) {
        self.bus.send_playback(action);
    }

    /// Enqueues a song.
    pub fn enqueue(&self, song: Song) {
        self.send_playback(PlaybackAction::Enqueue { song });
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.path().join("player_state.json")
    }

    pub async fn stream_state(&self) -> Option<StreamState> {
        self.player.read().await.stream_state()
    }

    pub async fn current_id(&self) -> Option<String> {
        let player = self.player.read().await;
        player.state.playlist.current.as_ref().map(|s| s.id.clone())
    }
}

/// Collects all events from a subscriber within a timeout period.
/// Returns events in the order they were received.
pub async fn collect_events(subscriber: &mut Subscriber, timeout: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match subscriber.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) => {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(TryRecvError::Lagged(n)) => {
                eprintln!("Warning: subscriber lagged, missed {n} events");
            }
            Err(TryRecvError::Closed) => break,
        }
    }

    events
}

/// Waits for a specific type of event within a timeout.
pub async fn wait_for_event<F>(
    subscriber: &mut Subscriber,
    timeout: Duration,
    matches: F,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match subscriber.try_recv() {
            Ok(event) if matches(&event) => return Some(event),
            Ok(_) => continue,
            Err(TryRecvError::Empty) => {
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => return None,
        }
    }
}

/// Waits for a bot message containing `substring`.
pub async fn wait_for_message(
    subscriber: &mut Subscriber,
    timeout: Duration,
    substring: &str,
) -> Option<Event> {
    wait_for_event(subscriber, timeout, |e| is_message_containing(e, substring)).await
}

/// Polls `condition` until it holds or the timeout passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Checks if an event is a Message::Send with text containing a substring.
pub fn is_message_containing(event: &Event, substring: &str) -> bool {
    matches!(event, Event::Message(MessageAction::Send { text, .. }) if text.contains(substring))
}

/// Checks if any event in the list contains the given substring in its message.
pub fn has_message_containing(events: &[Event], substring: &str) -> bool {
    events.iter().any(|e| is_message_containing(e, substring))
}

/// Extracts the text from Message::Send events.
pub fn extract_message_texts(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Message(MessageAction::Send { text, .. }) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Asserts that a specific event type was received.
#[macro_export]
macro_rules! assert_event_received {
    ($events:expr, $pattern:pat) => {
        assert!(
            $events.iter().any(|e| matches!(e, $pattern)),
            "Expected event matching {} not found in {:?}",
            stringify!($pattern),
            $events
        );
    };
}

/// Asserts that a specific event type was NOT received.
#[macro_export]
macro_rules! assert_event_not_received {
    ($events:expr, $pattern:pat) => {
        assert!(
            !$events.iter().any(|e| matches!(e, $pattern)),
            "Unexpected event matching {} found in {:?}",
            stringify!($pattern),
            $events
        );
    };
}
