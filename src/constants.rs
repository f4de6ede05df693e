use std::time::Duration;

// Audio parameters (Discord native format)
pub const SAMPLE_RATE: u32 = 48000; // 48 kHz sample rate
pub const BIT_DEPTH: u16 = 16; // 16 bits per sample
pub const CHANNELS: u16 = 2; // Stereo channel

/// Wall-clock length of one PCM frame
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per channel in one frame (960 at 48 kHz)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE as usize / 1000) * 20;

/// Bytes in one interleaved s16le frame (3840)
pub const FRAME_SIZE: usize = SAMPLES_PER_FRAME * CHANNELS as usize * (BIT_DEPTH as usize / 8);
