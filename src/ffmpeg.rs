//! ffmpeg decoder subprocess producing raw s16le PCM on stdout.

use crate::{
    constants::{CHANNELS, SAMPLE_RATE},
    source::{fill_frame, PcmSource},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::{self, BufRead, BufReader},
    process::{Child, ChildStdout, Command, Stdio},
    str::FromStr,
    time::Duration,
};

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;

/// Per-stage limits of ffmpeg's `atempo` filter
const ATEMPO_MIN: f64 = 0.5;
const ATEMPO_MAX: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFilter {
    BassBoost,
    Nightcore,
    Vaporwave,
    Karaoke,
    Echo,
    #[serde(rename = "8d")]
    EightD,
}

impl AudioFilter {
    pub const ALL: [AudioFilter; 6] = [
        AudioFilter::BassBoost,
        AudioFilter::Nightcore,
        AudioFilter::Vaporwave,
        AudioFilter::Karaoke,
        AudioFilter::Echo,
        AudioFilter::EightD,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AudioFilter::BassBoost => "bassboost",
            AudioFilter::Nightcore => "nightcore",
            AudioFilter::Vaporwave => "vaporwave",
            AudioFilter::Karaoke => "karaoke",
            AudioFilter::Echo => "echo",
            AudioFilter::EightD => "8d",
        }
    }

    pub fn ffmpeg_filter(&self) -> &'static str {
        match self {
            AudioFilter::BassBoost => "bass=g=10",
            AudioFilter::Nightcore => "aresample=48000,asetrate=48000*1.25,aresample=48000",
            AudioFilter::Vaporwave => "aresample=48000,asetrate=48000*0.8,aresample=48000",
            AudioFilter::Karaoke => "stereotools=mlev=0.015625",
            AudioFilter::Echo => "aecho=0.8:0.9:1000:0.3",
            AudioFilter::EightD => "apulsator=hz=0.08",
        }
    }

    /// How much faster than real time the filter consumes the source
    pub fn tempo_factor(&self) -> f64 {
        match self {
            AudioFilter::Nightcore => 1.25,
            AudioFilter::Vaporwave => 0.8,
            _ => 1.0,
        }
    }
}

impl fmt::Display for AudioFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AudioFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        AudioFilter::ALL
            .into_iter()
            .find(|filter| filter.name() == s)
            .with_context(|| format!("Unknown filter: {s}"))
    }
}

/// Parses a filter argument where `off` / `none` clears the filter
pub fn parse_filter_arg(s: &str) -> Result<Option<AudioFilter>> {
    match s.trim().to_lowercase().as_str() {
        "off" | "none" | "clear" => Ok(None),
        other => other.parse().map(Some),
    }
}

/// Splits `speed` into `atempo` stages that each stay within ffmpeg's limits.
pub fn atempo_chain(speed: f64) -> Vec<String> {
    let mut remaining = speed.clamp(MIN_SPEED, MAX_SPEED);
    let mut stages = vec![];

    while remaining > ATEMPO_MAX {
        stages.push(ATEMPO_MAX);
        remaining /= ATEMPO_MAX;
    }
    while remaining < ATEMPO_MIN {
        stages.push(ATEMPO_MIN);
        remaining /= ATEMPO_MIN;
    }
    if (remaining - 1.0).abs() > 1e-9 {
        stages.push(remaining);
    }

    stages
        .into_iter()
        .map(|stage| format!("atempo={stage}"))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct FfmpegOptions {
    /// Local path or URL
    pub input: String,
    /// Position in the track to start decoding from
    pub start_offset: Duration,
    pub speed: f64,
    pub filter: Option<AudioFilter>,
}

impl FfmpegOptions {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            start_offset: Duration::ZERO,
            speed: 1.0,
            filter: None,
        }
    }

    pub fn with_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_filter(mut self, filter: Option<AudioFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn is_network_input(&self) -> bool {
        self.input.starts_with("http://") || self.input.starts_with("https://")
    }

    /// Track time consumed per second of output
    pub fn playback_rate(&self) -> f64 {
        let filter_factor = self.filter.map(|f| f.tempo_factor()).unwrap_or(1.0);
        self.speed.clamp(MIN_SPEED, MAX_SPEED) * filter_factor
    }

    /// Combined `-af` filter graph, if any
    pub fn filter_graph(&self) -> Option<String> {
        let mut filters: Vec<String> = vec![];
        if let Some(filter) = self.filter {
            filters.push(filter.ffmpeg_filter().to_string());
        }
        filters.extend(atempo_chain(self.speed));

        if filters.is_empty() {
            None
        } else {
            Some(filters.join(","))
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "warning"]
            .map(String::from)
            .to_vec();

        if self.is_network_input() {
            args.extend(
                [
                    "-reconnect",
                    "1",
                    "-reconnect_streamed",
                    "1",
                    "-reconnect_delay_max",
                    "5",
                ]
                .map(String::from),
            );
        }

        if !self.start_offset.is_zero() {
            args.push("-ss".to_string());
            args.push(format!("{:.3}", self.start_offset.as_secs_f64()));
        }

        args.push("-i".to_string());
        args.push(self.input.clone());
        args.push("-vn".to_string());

        if let Some(graph) = self.filter_graph() {
            args.push("-af".to_string());
            args.push(graph);
        }

        args.extend([
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            CHANNELS.to_string(),
            "pipe:1".to_string(),
        ]);

        args
    }
}

/// A running ffmpeg process. Killed and reaped on drop.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
}

impl FfmpegSource {
    pub fn spawn(ffmpeg_path: &str, options: &FfmpegOptions) -> Result<Self> {
        let args = options.args();
        debug!("Spawning {ffmpeg_path} {}", args.join(" "));

        let mut child = Command::new(ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {ffmpeg_path}"))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("Failed to get ffmpeg stdout");
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let result = std::thread::Builder::new()
                .name("ffmpeg-stderr".to_string())
                .spawn(move || {
                    // Print stderr to log
                    for line in BufReader::new(stderr).lines().map_while(io::Result::ok) {
                        debug!("ffmpeg stderr: {}", line);
                    }
                });
            if let Err(e) = result {
                warn!("Could not spawn ffmpeg stderr reader: {e}");
            }
        }

        Ok(Self { child, stdout })
    }
}

impl PcmSource for FfmpegSource {
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = fill_frame(&mut self.stdout, buf)?;
        if read < buf.len() {
            // stdout is closed, only the exit status tells a crash from the end of the track
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!("ffmpeg exited with {status}")));
            }
        }
        Ok(read)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => trace!("ffmpeg exited with {status}"),
            Err(e) => warn!("Failed to reap ffmpeg process: {e}"),
        }
    }
}

/// Opens decoder sources for the player.
pub trait SourceFactory: Send + Sync {
    fn open(&self, options: &FfmpegOptions) -> Result<Box<dyn PcmSource>>;
}

pub struct FfmpegSpawner {
    ffmpeg_path: String,
}

impl FfmpegSpawner {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl SourceFactory for FfmpegSpawner {
    fn open(&self, options: &FfmpegOptions) -> Result<Box<dyn PcmSource>> {
        let source = FfmpegSource::spawn(&self.ffmpeg_path, options)?;
        Ok(Box::new(source))
    }
}
