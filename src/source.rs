//! PCM sources the streamer pulls fixed-size frames from.

use std::io::{self, Read};

/// A source of raw s16le PCM.
pub trait PcmSource: Send {
    /// Fill `buf` with the next frame.
    ///
    /// Returns the number of bytes read. Anything less than `buf.len()` means
    /// the source is exhausted.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Read until `buf` is full or the reader hits EOF.
pub fn fill_frame<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Adapts any blocking reader into a `PcmSource`
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> PcmSource for ReaderSource<R> {
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        fill_frame(&mut self.reader, buf)
    }
}
