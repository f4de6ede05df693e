//! voice-streamer-rs library crate
//!
//! This module exposes internal types for integration testing.
//! The main binary is in main.rs.

#[macro_use]
extern crate log;

pub mod command;
pub mod config;
pub mod constants;
pub mod event;
pub mod extractor;
pub mod ffmpeg;
pub mod message;
pub mod net;
pub mod player;
pub mod playlist;
pub mod sink;
pub mod source;
pub mod stdin;
pub mod streamer;
pub mod volume;

#[cfg(feature = "discord")]
pub mod discord;
