//! Discord transport for the player.
//!
//! - Joins the configured voice channel and plays the live frame stream
//! - Text commands (`!play ...`) in the configured channel
//! - A handful of slash commands
//! - Bot announcements posted to the channel, with embeds where useful

use crate::{
    command,
    config::DiscordConfig,
    event::EventBus,
    message::{fmt_duration, MessageAction, NowPlayingInfo, RichContent},
    player::PlaybackAction,
    sink::{FrameReceiver, FrameSender},
};
use anyhow::{Context as _, Result};
use byteorder::{ByteOrder, LittleEndian};
use poise::serenity_prelude::{
    self as serenity, ChannelId, CreateEmbed, CreateMessage, GuildId, Http,
};
use songbird::{
    input::{Input, RawAdapter},
    tracks::Track,
    SerenityInit,
};
use std::{
    io::{Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::io::MediaSource;
use tokio::sync::{broadcast::error::TryRecvError, RwLock};

/// Discord bot state shared across handlers
struct BotState {
    bus: EventBus,
    channel_id: ChannelId,
    /// HTTP client for sending messages (set when bot is ready)
    http: Option<Arc<Http>>,
    frames: FrameSender,
}

type Context<'a> = poise::Context<'a, Arc<RwLock<BotState>>, anyhow::Error>;

// ============================================================================
// Voice Audio Source
// ============================================================================

/// Pull-based audio source fed by the streamer's frame broadcast.
/// Songbird's audio thread calls Read::read(); gaps are filled with silence.
struct VoiceFeed {
    rx: FrameReceiver,
    pending: Vec<u8>,
    offset: usize,
}

impl VoiceFeed {
    fn new(rx: FrameReceiver) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }

    /// Next s16le sample, or None if no frame is buffered
    fn next_sample(&mut self) -> Option<i16> {
        while self.offset + 2 > self.pending.len() {
            match self.rx.try_recv() {
                Ok(frame) => {
                    self.pending = frame.to_vec();
                    self.offset = 0;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    trace!("Voice feed skipped {skipped} frames");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }

        let sample = LittleEndian::read_i16(&self.pending[self.offset..self.offset + 2]);
        self.offset += 2;
        Some(sample)
    }
}

impl Read for VoiceFeed {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // f32 output, 4 bytes per sample
        let writable = buf.len() / 4 * 4;

        for chunk in buf[..writable].chunks_exact_mut(4) {
            let sample = self.next_sample().unwrap_or(0) as f32 / 32768.0;
            chunk.copy_from_slice(&sample.to_le_bytes());
        }

        Ok(writable)
    }
}

impl Seek for VoiceFeed {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        // Live audio source doesn't support seeking
        Ok(0)
    }
}

impl MediaSource for VoiceFeed {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Create a songbird Input from the frame broadcast
fn create_voice_input(frames: &FrameSender) -> Input {
    let source = VoiceFeed::new(frames.subscribe());
    let adapter = RawAdapter::new(source, 48000, 2);

    adapter.into()
}

/// Initialize the Discord bot
pub async fn init(
    bus: &EventBus,
    discord_config: &DiscordConfig,
    frames: FrameSender,
) -> Result<()> {
    // Both ring and aws-lc may be linked in, so pick one explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    let channel_id = ChannelId::new(discord_config.discord_channel_id);
    let guild_id = GuildId::new(discord_config.discord_guild_id);
    let voice_channel_id = discord_config.discord_voice_channel_id.map(ChannelId::new);
    let token = discord_config.discord_token.clone();

    let state = Arc::new(RwLock::new(BotState {
        bus: bus.clone(),
        channel_id,
        http: None,
        frames,
    }));

    start_outgoing_message_handler(bus.clone(), state.clone());

    let state_for_setup = state.clone();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![play(), skip(), pause(), resume(), seek(), queue()],
            event_handler: |ctx, event, _framework, data| Box::pin(event_handler(ctx, event, data)),
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            let state = state_for_setup.clone();
            Box::pin(async move {
                {
                    let mut state_write = state.write().await;
                    state_write.http = Some(ctx.http.clone());
                }

                poise::builtins::register_in_guild(ctx, &framework.options().commands, guild_id)
                    .await?;

                if let Some(vc_id) = voice_channel_id {
                    let manager = songbird::get(ctx)
                        .await
                        .context("Songbird voice client was not registered")?;

                    match manager.join(guild_id, vc_id).await {
                        Ok(handler_lock) => {
                            let input = {
                                let state = state.read().await;
                                create_voice_input(&state.frames)
                            };
                            let mut handler = handler_lock.lock().await;
                            handler.play_only(Track::new(input));
                            info!("Joined voice channel {}", vc_id);
                        }
                        Err(e) => {
                            error!("Failed to join voice channel: {:?}", e);
                        }
                    }
                }

                info!("Discord bot ready and commands registered!");
                Ok(state)
            })
        })
        .build();

    let intents = serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_VOICE_STATES;

    let client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .register_songbird()
        .await?;

    tokio::spawn(async move {
        let mut client = client;
        if let Err(e) = client.start().await {
            error!("Discord client error: {:?}", e);
        }
    });

    Ok(())
}

/// Handle Discord gateway events
async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: &Arc<RwLock<BotState>>,
) -> Result<(), anyhow::Error> {
    if let serenity::FullEvent::Message { new_message } = event {
        let state = data.read().await;

        // Only process messages from the configured channel
        if new_message.channel_id != state.channel_id || new_message.author.bot {
            return Ok(());
        }

        if let Some(action) = command::parse(&new_message.content, &new_message.author.name) {
            info!(
                "Discord text command from {}: {}",
                new_message.author.name, new_message.content
            );
            state.bus.send_playback(action);
        }
    }

    Ok(())
}

fn now_playing_embed(info: &NowPlayingInfo) -> CreateEmbed {
    let mut embed = CreateEmbed::new()
        .title(if info.is_playing { "Now playing" } else { "Paused" })
        .description(format!("[{}]({})", info.song.title, info.song.url))
        .field(
            "Progress",
            format!(
                "{}/{}",
                fmt_duration(info.progress_secs),
                fmt_duration(info.song.duration)
            ),
            true,
        )
        .field("Queued by", &info.song.queued_by, true);

    if (info.speed - 1.0).abs() > f64::EPSILON {
        embed = embed.field("Speed", format!("{}x", info.speed), true);
    }
    if let Some(filter) = info.filter {
        embed = embed.field("Filter", filter.to_string(), true);
    }

    embed.color(0x1DB954)
}

fn create_embed(rich: &RichContent) -> Option<CreateEmbed> {
    let embed = match rich {
        RichContent::NowPlaying { info } => now_playing_embed(info),
        RichContent::SongEnqueued {
            song,
            position,
            time_until_playback_secs,
        } => CreateEmbed::new()
            .title("Added to queue")
            .description(format!("[{}]({})", song.title, song.url))
            .field("Position", position.to_string(), true)
            .field("Plays in", fmt_duration(*time_until_playback_secs), true)
            .color(0x5865F2),
        RichContent::Error { message } => CreateEmbed::new()
            .title("Error")
            .description(message)
            .color(0xED4245),
        RichContent::QueueStatus { .. } | RichContent::SongRemoved { .. } => return None,
    };

    Some(embed)
}

fn start_outgoing_message_handler(bus: EventBus, state: Arc<RwLock<BotState>>) {
    tokio::spawn(async move {
        let mut bus_rx = bus.subscribe();

        loop {
            let MessageAction::Send { text, rich } = bus_rx.recv_message().await;

            // Skip until the bot is ready
            let (http, channel_id) = {
                let state_guard = state.read().await;
                match &state_guard.http {
                    Some(http) => (http.clone(), state_guard.channel_id),
                    None => continue,
                }
            };

            let message = match rich.as_ref().and_then(create_embed) {
                Some(embed) => CreateMessage::new().embed(embed),
                None => CreateMessage::new().content(text),
            };

            if let Err(e) = channel_id.send_message(&http, message).await {
                error!("Failed to send Discord message: {:?}", e);
            }
        }
    });
}

// ============================================================================
// Slash commands
// ============================================================================

async fn send_action(ctx: &Context<'_>, action: PlaybackAction) {
    let state = ctx.data().read().await;
    state.bus.send_playback(action);
}

/// Queue a song from YouTube
#[poise::command(slash_command)]
async fn play(
    ctx: Context<'_>,
    #[description = "YouTube URL or search terms"] query: String,
) -> Result<(), anyhow::Error> {
    let queued_by = ctx.author().name.clone();
    send_action(
        &ctx,
        PlaybackAction::Request {
            query: query.clone(),
            queued_by,
        },
    )
    .await;
    ctx.say(format!("Looking up {query}")).await?;
    Ok(())
}

/// Skip the current song
#[poise::command(slash_command)]
async fn skip(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    send_action(&ctx, PlaybackAction::Skip).await;
    ctx.say("Skipping to next song").await?;
    Ok(())
}

/// Pause playback
#[poise::command(slash_command)]
async fn pause(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    send_action(&ctx, PlaybackAction::Pause).await;
    ctx.say("Pausing playback").await?;
    Ok(())
}

/// Resume playback
#[poise::command(slash_command)]
async fn resume(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    send_action(&ctx, PlaybackAction::Play).await;
    ctx.say("Resuming playback").await?;
    Ok(())
}

/// Jump to a position in the current song
#[poise::command(slash_command)]
async fn seek(
    ctx: Context<'_>,
    #[description = "Position like 1:30"] position: String,
) -> Result<(), anyhow::Error> {
    match command::parse_timestamp(&position) {
        Some(position) => {
            send_action(&ctx, PlaybackAction::Seek { position }).await;
            ctx.say(format!("Seeking to {}", fmt_duration(position.as_secs())))
                .await?;
        }
        None => {
            ctx.say("Invalid position, use SS, M:SS or H:MM:SS").await?;
        }
    }
    Ok(())
}

/// Show the queue
#[poise::command(slash_command)]
async fn queue(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    send_action(&ctx, PlaybackAction::ListQueue { offset: None }).await;
    ctx.say("Fetching queue...").await?;
    Ok(())
}
