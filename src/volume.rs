//! In-place volume scaling of interleaved s16le PCM frames.

use byteorder::{ByteOrder, LittleEndian};

pub const MIN_VOLUME: f64 = 0.0;
pub const MAX_VOLUME: f64 = 2.0;

/// Clamp a requested volume into the supported range. NaN maps to silence.
pub fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        return MIN_VOLUME;
    }
    volume.clamp(MIN_VOLUME, MAX_VOLUME)
}

/// Scale every sample in `frame` by `volume`, saturating at the i16 bounds.
///
/// A trailing odd byte is left untouched. Same input bytes and factor always
/// produce the same output bytes.
pub fn scale_frame(frame: &mut [u8], volume: f64) {
    if volume == 1.0 {
        return;
    }

    let even_len = frame.len() & !1;
    for sample in frame[..even_len].chunks_exact_mut(2) {
        let value = LittleEndian::read_i16(sample) as f64 * volume;
        let scaled = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        LittleEndian::write_i16(sample, scaled);
    }
}
