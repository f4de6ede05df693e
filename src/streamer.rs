//! Paced PCM streamer.
//!
//! Pulls fixed-size frames from a [`PcmSource`] on a dedicated thread and
//! forwards them to a [`FrameSink`] at a fixed wall-clock cadence. The source
//! can be swapped while streaming, which is how seek, speed and filter changes
//! respawn the decoder without interrupting the session.
//!
//! State machine: `Idle -> Running <-> Paused -> Stopped`. `Replacing` is only
//! held while the source is being swapped under the lock.
//!
//! The source sits behind its own lock, so a decoder that stalls a read never
//! blocks `pause`, `stop` or position queries. Only `replace_source` waits for
//! the read in flight.

use crate::{
    constants::{FRAME_DURATION, FRAME_SIZE},
    sink::FrameSink,
    source::PcmSource,
    volume::{clamp_volume, scale_frame},
};
use anyhow::{anyhow, bail, Context, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Running,
    Paused,
    Replacing,
    Stopped,
}

/// Why a stream ended. Delivered exactly once to the completion callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The source returned a short or empty read
    Finished,
    /// `stop()` was called
    Stopped,
    /// Reading the source or writing the sink failed
    Failed(String),
}

pub type CompletionCallback = Box<dyn FnOnce(StreamEnd) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamerConfig {
    /// Bytes per frame
    pub frame_size: usize,
    /// Wall-clock time between frames
    pub frame_duration: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            frame_duration: FRAME_DURATION,
        }
    }
}

impl StreamerConfig {
    /// Playback time covered by `frames` frames
    pub fn duration_of(&self, frames: u64) -> Duration {
        let nanos = (self.frame_duration.as_nanos() as u64).saturating_mul(frames);
        Duration::from_nanos(nanos)
    }

    /// Number of whole frames that fit in `duration`
    pub fn frames_in(&self, duration: Duration) -> u64 {
        let frame_nanos = self.frame_duration.as_nanos().max(1);
        (duration.as_nanos() / frame_nanos) as u64
    }
}

struct Inner {
    state: StreamState,
    frames: u64,
    volume: f64,
    /// Bumped whenever the pacing clock must restart (resume, source swap)
    clock_epoch: u64,
    /// Bumped on every source swap, frames read before a swap are dropped
    source_epoch: u64,
}

type SharedSource = Option<Box<dyn PcmSource>>;

/// Lock order is `source` before `inner`.
struct Shared {
    inner: Mutex<Inner>,
    source: Mutex<SharedSource>,
    wake: Condvar,
    config: StreamerConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_source(&self) -> MutexGuard<'_, SharedSource> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while_paused<'a>(&self, mut inner: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        while inner.state == StreamState::Paused {
            inner = self
                .wake
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner
    }
}

pub struct AudioStreamer {
    shared: Arc<Shared>,
    pending: Mutex<Option<(Box<dyn FrameSink>, CompletionCallback)>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioStreamer {
    pub fn new(
        source: Box<dyn PcmSource>,
        sink: Box<dyn FrameSink>,
        config: StreamerConfig,
        on_complete: CompletionCallback,
    ) -> Self {
        let inner = Inner {
            state: StreamState::Idle,
            frames: 0,
            volume: 1.0,
            clock_epoch: 0,
            source_epoch: 0,
        };

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                source: Mutex::new(Some(source)),
                wake: Condvar::new(),
                config,
            }),
            pending: Mutex::new(Some((sink, on_complete))),
            thread: Mutex::new(None),
        }
    }

    fn take_pending(&self) -> Option<(Box<dyn FrameSink>, CompletionCallback)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Spawn the pacing thread. Only valid from `Idle`.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.state != StreamState::Idle {
            bail!("Cannot start streamer in state {:?}", inner.state);
        }

        let (sink, on_complete) = self
            .take_pending()
            .context("Streamer sink was already consumed")?;

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("audio-streamer".to_string())
            .spawn(move || run(shared, sink, on_complete))
            .context("Failed to spawn audio streamer thread")?;

        inner.state = StreamState::Running;
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        debug!("Audio streamer started");
        Ok(())
    }

    /// Returns true if the stream was running and is now paused.
    pub fn pause(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != StreamState::Running {
            return false;
        }
        inner.state = StreamState::Paused;
        debug!("Audio streamer paused at frame {}", inner.frames);
        true
    }

    /// Returns true if the stream was paused and is now running.
    pub fn resume(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != StreamState::Paused {
            return false;
        }
        inner.state = StreamState::Running;
        inner.clock_epoch += 1;
        self.shared.wake.notify_all();
        debug!("Audio streamer resumed at frame {}", inner.frames);
        true
    }

    /// Stop streaming. The completion callback fires with `StreamEnd::Stopped`
    /// unless the stream already ended on its own. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let was_idle = {
            let mut inner = self.shared.lock();
            if inner.state == StreamState::Stopped {
                return false;
            }
            let was_idle = inner.state == StreamState::Idle;
            inner.state = StreamState::Stopped;
            self.shared.wake.notify_all();
            was_idle
        };

        // Never started, so there is no thread to drop the source or report completion
        if was_idle {
            drop(self.shared.lock_source().take());
            if let Some((_sink, on_complete)) = self.take_pending() {
                on_complete(StreamEnd::Stopped);
            }
        }

        debug!("Audio streamer stopped");
        true
    }

    /// Swap the underlying source while streaming.
    ///
    /// Waits for a read in flight, then swaps the source. A frame read from
    /// the old source is never forwarded. The old source is dropped (killing
    /// its process) after both locks are released. With `frames == None` the
    /// frame counter is kept so elapsed time stays continuous; `Some(n)` sets
    /// it explicitly. Returns the frame counter the new source starts at.
    pub fn replace_source(&self, source: Box<dyn PcmSource>, frames: Option<u64>) -> Result<u64> {
        let mut current = self.shared.lock_source();

        let (old, frames) = {
            let mut inner = self.shared.lock();
            let previous = inner.state;
            if previous == StreamState::Stopped {
                bail!("Cannot replace the source of a stopped stream");
            }

            inner.state = StreamState::Replacing;
            let old = current.replace(source);
            if let Some(frames) = frames {
                inner.frames = frames;
            }
            inner.source_epoch += 1;
            inner.clock_epoch += 1;
            inner.state = previous;
            (old, inner.frames)
        };

        drop(current);
        drop(old);

        debug!("Audio streamer source replaced, frame counter at {frames}");
        Ok(frames)
    }

    pub fn set_volume(&self, volume: f64) {
        self.shared.lock().volume = clamp_volume(volume);
    }

    pub fn volume(&self) -> f64 {
        self.shared.lock().volume
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    pub fn frames_forwarded(&self) -> u64 {
        self.shared.lock().frames
    }

    /// `frames_forwarded × frame_duration`
    pub fn elapsed(&self) -> Duration {
        let frames = self.frames_forwarded();
        self.shared.config.duration_of(frames)
    }

    pub fn config(&self) -> StreamerConfig {
        self.shared.config
    }

    /// Wait for the pacing thread to exit. Returns immediately if it never started.
    pub fn join(&self) -> Result<()> {
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("Audio streamer thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for AudioStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleeps so that tick `n` lands at `start + n × delay`, absorbing jitter
/// from slow reads instead of accumulating it.
struct PacingClock {
    start: Instant,
    ticks: u32,
    delay: Duration,
}

impl PacingClock {
    fn new(delay: Duration) -> Self {
        Self {
            start: Instant::now(),
            ticks: 0,
            delay,
        }
    }

    fn reset(&mut self) {
        self.start = Instant::now();
        self.ticks = 0;
    }

    fn tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
        let next = self.start + self.delay.saturating_mul(self.ticks);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }
}

fn run(shared: Arc<Shared>, mut sink: Box<dyn FrameSink>, on_complete: CompletionCallback) {
    let config = shared.config;
    let mut frame = vec![0u8; config.frame_size];
    let mut clock = PacingClock::new(config.frame_duration);
    let mut clock_epoch = 0;

    let end = loop {
        {
            let inner = shared.wait_while_paused(shared.lock());
            if inner.state == StreamState::Stopped {
                break StreamEnd::Stopped;
            }
        }

        // Only the source lock is held while the decoder blocks
        let (read, read_epoch) = {
            let mut source = shared.lock_source();
            let read_epoch = shared.lock().source_epoch;
            let read = match source.as_mut() {
                Some(source) => source.read_frame(&mut frame),
                None => Ok(0),
            };
            (read, read_epoch)
        };

        let mut inner = shared.wait_while_paused(shared.lock());

        if inner.state == StreamState::Stopped {
            break StreamEnd::Stopped;
        }

        if inner.source_epoch != read_epoch {
            trace!("Source replaced during read, dropping frame");
            continue;
        }

        let read = match read {
            Ok(read) => read,
            Err(e) => break StreamEnd::Failed(format!("read error: {e}")),
        };

        if read < frame.len() {
            debug!(
                "Short read ({read}/{} bytes) after {} frames, ending stream",
                frame.len(),
                inner.frames
            );
            break StreamEnd::Finished;
        }

        if inner.clock_epoch != clock_epoch {
            clock_epoch = inner.clock_epoch;
            clock.reset();
        }

        scale_frame(&mut frame, inner.volume);

        if let Err(e) = sink.send_frame(&frame) {
            break StreamEnd::Failed(format!("sink error: {e:#}"));
        }
        inner.frames += 1;
        trace!("Forwarded frame {}", inner.frames);

        drop(inner);
        clock.tick();
    };

    shared.lock().state = StreamState::Stopped;
    drop(shared.lock_source().take());

    debug!("Audio streamer finished: {:?}", end);
    on_complete(end);
}
