//! Console control: each stdin line is parsed as a text command.

use crate::{command, event::EventBus};
use tokio::io::{AsyncBufReadExt, BufReader};

const CONSOLE_NICK: &str = "console";

pub fn start(bus: EventBus) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("stdin closed, console input disabled");
                    break;
                }
                Err(e) => {
                    error!("Error reading stdin: {e}");
                    break;
                }
            };

            match command::parse(&line, CONSOLE_NICK) {
                Some(action) => bus.send_playback(action),
                None if line.trim().is_empty() => {}
                None => warn!("Unrecognised command: {}", line.trim()),
            }
        }
    });
}
