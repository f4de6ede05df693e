//! Transport sinks that receive paced PCM frames.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Receives one full PCM frame per pacing tick.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// Builds a fresh sink for every stream the player starts
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn FrameSink> + Send + Sync>;

/// Capacity of the frame broadcast channel, roughly one second of audio
pub const FRAME_CHANNEL_CAPACITY: usize = 50;

pub type FrameSender = broadcast::Sender<Bytes>;
pub type FrameReceiver = broadcast::Receiver<Bytes>;

pub fn frame_channel() -> FrameSender {
    let (tx, _rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
    tx
}

/// Fans frames out to every subscribed consumer (TCP listeners, voice feed).
#[derive(Clone)]
pub struct BroadcastSink {
    tx: FrameSender,
}

impl BroadcastSink {
    pub fn new(tx: FrameSender) -> Self {
        Self { tx }
    }

    pub fn factory(tx: FrameSender) -> SinkFactory {
        Arc::new(move || Box::new(BroadcastSink::new(tx.clone())) as Box<dyn FrameSink>)
    }
}

impl FrameSink for BroadcastSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        // No listeners is fine, the frame is simply dropped
        if self.tx.send(Bytes::copy_from_slice(frame)).is_err() {
            trace!("No frame subscribers, dropping frame");
        }
        Ok(())
    }
}
