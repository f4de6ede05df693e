#[macro_use]
extern crate log;

use anyhow::Result;
use std::sync::Arc;
use voice_streamer_rs::{
    config, event,
    event::EventBus,
    extractor::{self, YtDlp},
    ffmpeg::FfmpegSpawner,
    message, net, player,
    player::PlayerBackend,
    sink::{frame_channel, BroadcastSink},
    stdin,
    streamer::StreamerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let config = config::load().await?;
    extractor::init(&config.player.ytdlp_path).await?;

    let bus = EventBus::new();
    let frames = frame_channel();

    let backend = PlayerBackend {
        extractor: Arc::new(YtDlp::new(config.player.ytdlp_path.clone())),
        sources: Arc::new(FfmpegSpawner::new(config.player.ffmpeg_path.clone())),
        sinks: BroadcastSink::factory(frames.clone()),
    };
    let _player = player::init(
        &bus,
        config.player.clone(),
        StreamerConfig::default(),
        backend,
    )
    .await;

    if let Some(addr) = &config.net.listen_addr {
        net::start(addr, frames.clone()).await?;
    }

    stdin::start(bus.clone());

    #[cfg(feature = "discord")]
    {
        match &config.discord {
            Some(discord_config) => {
                voice_streamer_rs::discord::init(&bus, discord_config, frames.clone()).await?
            }
            None => message::start_console_output(&bus),
        }
    }

    #[cfg(not(feature = "discord"))]
    message::start_console_output(&bus);

    event::debug(&bus);

    info!("Ready, type !play <url or search terms>");
    tokio::signal::ctrl_c().await?;

    Ok(())
}
