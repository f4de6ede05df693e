//! Text command parser shared by the console and chat integrations.

use crate::{ffmpeg::parse_filter_arg, player::PlaybackAction};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

lazy_static! {
    static ref TIMESTAMP_RE: Regex =
        Regex::new(r"^(?:(?:(\d+):)?(\d+):)?(\d+)$").expect("valid timestamp regex");
}

/// Parses `SS`, `M:SS` or `H:MM:SS`
pub fn parse_timestamp(s: &str) -> Option<Duration> {
    let caps = TIMESTAMP_RE.captures(s.trim())?;
    let field = |i: usize| -> Option<u64> {
        caps.get(i)
            .map(|m| m.as_str().parse().ok())
            .unwrap_or(Some(0))
    };

    let (hours, minutes, seconds) = (field(1)?, field(2)?, field(3)?);
    if caps.get(2).is_some() && seconds >= 60 {
        return None;
    }
    if caps.get(1).is_some() && minutes >= 60 {
        return None;
    }
    let secs = hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;
    Some(Duration::from_secs(secs))
}

/// Parses a volume percentage (`0`–`200`, optional `%`) into a factor
pub fn parse_volume(s: &str) -> Option<f64> {
    let percent: f64 = s.trim().trim_end_matches('%').parse().ok()?;
    if !(0.0..=200.0).contains(&percent) {
        return None;
    }
    Some(percent / 100.0)
}

/// Parses a speed like `1.25` or `1.25x`
pub fn parse_speed(s: &str) -> Option<f64> {
    s.trim().trim_end_matches(['x', 'X']).parse().ok()
}

/// Turn a `!command args` line into a playback action. Returns `None` for
/// anything that is not a recognised command or has invalid arguments.
pub fn parse(text: &str, nick: &str) -> Option<PlaybackAction> {
    let mut cmd_split = text.split_whitespace();
    let cmd = cmd_split.next()?;
    let args: Vec<&str> = cmd_split.collect();
    let arg = args.first().copied();

    match cmd {
        "!play" | "!p" => {
            let query = args.join(" ");
            if query.is_empty() {
                return Some(PlaybackAction::Play);
            }
            Some(PlaybackAction::Request {
                query,
                queued_by: nick.to_string(),
            })
        }
        "!resume" => Some(PlaybackAction::Play),
        "!pause" => Some(PlaybackAction::Pause),
        "!skip" | "!next" => Some(PlaybackAction::Skip),
        "!prev" | "!back" => Some(PlaybackAction::Prev),
        "!stop" => Some(PlaybackAction::Stop),
        "!seek" => Some(PlaybackAction::Seek {
            position: parse_timestamp(arg?)?,
        }),
        "!speed" => Some(PlaybackAction::SetSpeed {
            speed: parse_speed(arg?)?,
        }),
        "!filter" | "!fx" => Some(PlaybackAction::SetFilter {
            filter: parse_filter_arg(arg.unwrap_or("off")).ok()?,
        }),
        "!volume" | "!vol" => Some(PlaybackAction::SetVolume {
            volume: parse_volume(arg?)?,
        }),
        "!loop" => Some(PlaybackAction::SetLoop {
            mode: arg?.parse().ok()?,
        }),
        "!shuffle" => Some(PlaybackAction::Shuffle),
        "!clear" => Some(PlaybackAction::Clear),
        "!queue" | "!q" => Some(PlaybackAction::ListQueue {
            offset: arg.and_then(|a| a.parse().ok()),
        }),
        "!np" => Some(PlaybackAction::NowPlaying),
        "!rm" | "!remove" => match arg {
            Some(pos) => Some(PlaybackAction::Remove { pos: pos.parse().ok()? }),
            None => Some(PlaybackAction::RemoveByUser {
                user: nick.to_string(),
            }),
        },
        "!move" | "!mv" => {
            let from = args.first()?.parse().ok()?;
            let to = args.get(1)?.parse().ok()?;
            Some(PlaybackAction::Move { from, to })
        }
        _ => None,
    }
}
