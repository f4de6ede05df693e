use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt, str::FromStr};

/// Songs kept for `prev`
const MAX_HISTORY: usize = 50;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Song {
    pub id: String,
    pub url: String,
    pub title: String,
    pub channel: String,
    /// Length in seconds
    pub duration: u64,
    pub queued_by: String,
}

impl PartialEq for Song {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoopMode {
    #[default]
    Off,
    /// Repeat the current song
    Track,
    /// Requeue finished songs at the back
    Queue,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopMode::Off => "off",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        };
        f.write_str(s)
    }
}

impl FromStr for LoopMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(LoopMode::Off),
            "track" | "song" | "one" => Ok(LoopMode::Track),
            "queue" | "all" => Ok(LoopMode::Queue),
            other => bail!("Unknown loop mode: {other}"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Playlist {
    /// Song currently loaded in the player
    pub current: Option<Song>,
    pub upcoming: VecDeque<Song>,
    pub history: Vec<Song>,
    #[serde(default)]
    pub loop_mode: LoopMode,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of songs waiting after the current one
    pub fn len(&self) -> usize {
        self.upcoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.upcoming.is_empty()
    }

    pub fn contains(&self, song: &Song) -> bool {
        self.current.as_ref() == Some(song) || self.upcoming.contains(song)
    }

    /// Append a song and return its 1-based queue position.
    pub fn enqueue(&mut self, song: Song) -> Result<usize> {
        if self.contains(&song) {
            bail!("Song already in queue!");
        }
        self.upcoming.push_back(song);
        Ok(self.upcoming.len())
    }

    fn retire_current(&mut self) {
        if let Some(song) = self.current.take() {
            if self.loop_mode == LoopMode::Queue {
                self.upcoming.push_back(song.clone());
            }
            self.history.push(song);
            if self.history.len() > MAX_HISTORY {
                self.history.remove(0);
            }
        }
    }

    /// Move on after the current song finished naturally. Honours `LoopMode::Track`.
    pub fn advance(&mut self) -> Option<Song> {
        if self.loop_mode == LoopMode::Track && self.current.is_some() {
            return self.current.clone();
        }
        self.skip()
    }

    /// Move on because the user asked to, never repeating the current song.
    pub fn skip(&mut self) -> Option<Song> {
        self.retire_current();
        self.current = self.upcoming.pop_front();
        self.current.clone()
    }

    /// Drop the current song without recording it in history
    pub fn discard_current(&mut self) -> Option<Song> {
        let discarded = self.current.take();
        self.current = self.upcoming.pop_front();
        discarded
    }

    /// Go back to the last played song, pushing the current one back onto the queue.
    pub fn previous(&mut self) -> Option<Song> {
        let previous = self.history.pop()?;
        if self.loop_mode == LoopMode::Queue {
            // It was requeued at the back when it finished
            if let Some(pos) = self.upcoming.iter().rposition(|s| s == &previous) {
                self.upcoming.remove(pos);
            }
        }
        if let Some(current) = self.current.take() {
            self.upcoming.push_front(current);
        }
        self.current = Some(previous);
        self.current.clone()
    }

    /// Remove the song at 1-based position `pos` in the upcoming queue
    pub fn remove(&mut self, pos: usize) -> Option<Song> {
        if pos == 0 {
            return None;
        }
        self.upcoming.remove(pos - 1)
    }

    /// Remove the most recently queued upcoming song by `user`
    pub fn remove_latest_by(&mut self, user: &str) -> Option<Song> {
        let index = self.upcoming.iter().rposition(|s| s.queued_by == user)?;
        self.upcoming.remove(index)
    }

    /// Move a song between 1-based positions. `to` past the end moves it last.
    pub fn move_song(&mut self, from: usize, to: usize) -> Result<&Song> {
        if from == 0 || from > self.upcoming.len() {
            bail!("No song at position {from} in the queue");
        }
        if to == 0 {
            bail!("Invalid target position {to}");
        }

        let song = self.upcoming.remove(from - 1);
        let Some(song) = song else {
            bail!("No song at position {from} in the queue");
        };
        let index = (to - 1).min(self.upcoming.len());
        self.upcoming.insert(index, song);

        match self.upcoming.get(index) {
            Some(song) => Ok(song),
            None => bail!("Queue changed while moving"),
        }
    }

    pub fn shuffle(&mut self) {
        let mut rng = rand::rng();
        self.upcoming.make_contiguous().shuffle(&mut rng);
    }

    /// Empty the upcoming queue, returning how many songs were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.upcoming.len();
        self.upcoming.clear();
        count
    }

    /// Total seconds of everything after the current song
    pub fn upcoming_duration(&self) -> u64 {
        self.upcoming.iter().map(|song| song.duration).sum()
    }

    /// Upcoming songs with their 1-based positions
    pub fn page(&self, offset: usize, limit: usize) -> Vec<(usize, &Song)> {
        self.upcoming
            .iter()
            .enumerate()
            .skip(offset)
            .take(limit)
            .map(|(i, song)| (i + 1, song))
            .collect()
    }
}
