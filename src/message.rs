use crate::ffmpeg::AudioFilter;
use crate::playlist::{LoopMode, Song};

/// Rich message content for platforms that support it (e.g., Discord embeds)
#[derive(Clone, Debug)]
#[cfg_attr(not(feature = "discord"), allow(dead_code))]
pub enum RichContent {
    /// Queue status with optional progress information
    QueueStatus {
        now_playing: Option<NowPlayingInfo>,
        upcoming: Vec<Song>,
        queue_length: usize,
        queue_duration_secs: u64,
        loop_mode: LoopMode,
    },

    /// Song added to queue confirmation
    SongEnqueued {
        song: Song,
        position: usize,
        time_until_playback_secs: u64,
    },

    /// A new song started streaming
    NowPlaying { info: NowPlayingInfo },

    /// Song has been removed
    SongRemoved { title: String },

    /// Error message
    Error { message: String },
}

#[derive(Clone, Debug)]
#[cfg_attr(not(feature = "discord"), allow(dead_code))]
pub struct NowPlayingInfo {
    pub song: Song,
    pub progress_secs: u64,
    pub is_playing: bool,
    pub speed: f64,
    pub filter: Option<AudioFilter>,
}

/// Platform-agnostic outgoing message
#[derive(Clone, Debug)]
pub enum MessageAction {
    Send {
        /// Plain text fallback (used for the console and plain chat)
        text: String,
        /// Optional rich content for platforms that support it
        rich: Option<RichContent>,
    },
}

impl MessageAction {
    /// Create a simple text message from the bot
    pub fn bot_say(text: impl Into<String>) -> Self {
        MessageAction::Send {
            text: text.into(),
            rich: None,
        }
    }

    /// Create a message with rich content
    pub fn rich(text: impl Into<String>, rich: RichContent) -> Self {
        MessageAction::Send {
            text: text.into(),
            rich: Some(rich),
        }
    }

    /// Create an error message
    pub fn error(message: impl Into<String>) -> Self {
        let msg = message.into();
        MessageAction::Send {
            text: msg.clone(),
            rich: Some(RichContent::Error { message: msg }),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            MessageAction::Send { text, .. } => text,
        }
    }
}

/// Formats seconds as `M:SS`, or `H:MM:SS` past the hour
pub fn fmt_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

/// Log every outgoing message when no chat platform is attached
pub fn start_console_output(bus: &crate::event::EventBus) {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut bus = bus.subscribe();
        loop {
            let action = bus.recv_message().await;
            info!("> {}", action.text());
        }
    });
}
