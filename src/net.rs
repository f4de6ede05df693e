//! Streams the live PCM frames to TCP clients as an endless WAV file.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;

use crate::constants::{BIT_DEPTH, CHANNELS, SAMPLE_RATE};
use crate::sink::{FrameReceiver, FrameSender};

/// Header for an infinite 48 kHz / 16-bit / stereo WAV stream
pub fn wav_header() -> Vec<u8> {
    let spec = WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: BIT_DEPTH,
        sample_format: SampleFormat::Int,
    };

    spec.into_header_for_infinite_file()
}

/// Bind `addr` and serve every client the broadcast frames. Returns the bound address.
pub async fn start(addr: &str, frames: FrameSender) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!("Listening on {}", local_addr);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("Accepted connection from {}", addr);
                    let rx = frames.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, rx).await {
                            debug!("Client {} disconnected: {:#}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    });

    Ok(local_addr)
}

async fn serve_client(mut stream: TcpStream, mut rx: FrameReceiver) -> Result<()> {
    // Players recognize the stream as a wav file thanks to the header
    stream
        .write_all(&wav_header())
        .await
        .context("Failed to write wav header")?;

    loop {
        match rx.recv().await {
            Ok(frame) => stream
                .write_all(&frame)
                .await
                .context("Failed to write frame")?,
            Err(RecvError::Lagged(skipped)) => {
                warn!("TCP client lagging behind, skipped {skipped} frames");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
