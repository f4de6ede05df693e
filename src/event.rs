use crate::message::MessageAction;
use crate::player::PlaybackAction;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Backlog each subscriber may fall behind before it starts skipping events
pub const BUS_CAPACITY: usize = 100;

/// Process-wide pub/sub channel between the player, the streamers and the
/// chat transports.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(BUS_CAPACITY);
        Self { tx }
    }

    /// Safe to call from any thread, including the streamer's pacing thread.
    pub fn send(&self, event: Event) {
        if let Err(e) = self.tx.send(event) {
            // Only happens while nobody is subscribed, e.g. during shutdown
            debug!("Dropping event without subscribers: {:?}", e.0);
        }
    }

    pub fn send_playback(&self, action: PlaybackAction) {
        self.send(Event::Playback(action));
    }

    pub fn send_message(&self, action: MessageAction) {
        self.send(Event::Message(action));
    }

    /// Plain text message to whoever is listening
    pub fn say(&self, text: &str) {
        self.send_message(MessageAction::bot_say(text));
    }

    pub fn error(&self, text: &str) {
        self.send_message(MessageAction::error(text));
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber::new(self.tx.subscribe())
    }
}

pub struct Subscriber {
    rx: Receiver<Event>,
}

impl Subscriber {
    pub fn new(rx: Receiver<Event>) -> Self {
        Self { rx }
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        loop {
            match self.rx.try_recv() {
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagging behind, skipping {skipped} events");
                }
                other => return other,
            }
        }
    }

    /// Waits for the next event. Events lost to lag are skipped with a warning.
    pub async fn recv(&mut self) -> Event {
        loop {
            match self.rx.recv().await {
                Ok(event) => break event,
                Err(RecvError::Closed) => {
                    // The bus keeps its own sender, so this is unreachable while it lives
                    panic!("EventBus closed while a subscriber was still listening")
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagging behind, skipping {skipped} events");
                }
            }
        }
    }

    /// Waits for the next playback action, ignoring chat traffic.
    pub async fn recv_playback(&mut self) -> PlaybackAction {
        loop {
            if let Event::Playback(action) = self.recv().await {
                break action;
            }
        }
    }

    /// Waits for the next outgoing message, ignoring playback traffic.
    pub async fn recv_message(&mut self) -> MessageAction {
        loop {
            if let Event::Message(action) = self.recv().await {
                break action;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    Playback(PlaybackAction),
    Message(MessageAction),
}

/// Logs all bus traffic. Stream completions are frequent, so they go to trace.
pub fn debug(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                event @ Event::Playback(PlaybackAction::StreamEnded { .. }) => {
                    trace!("Received event: {:?}", event)
                }
                event => debug!("Received event: {:?}", event),
            }
        }
    });
}
