//! WebSocket message channel.
//!
//! Opens the socket, splits it, and spawns two tasks: a writer draining
//! an mpsc channel of outbound text frames, and a reader pumping typed
//! [`ChannelEvent`]s back to the room driver. Events carry the channel
//! generation so the room can ignore stragglers from a torn-down socket.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::RoomError;

/// Events surfaced by one channel generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(String),
    Closed { code: Option<u16>, reason: String },
    Error(String),
}

/// Sender half handed to the room core. Dropping it closes the socket.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSender {
    /// Build a sender plus the receiver a writer task (or a test) drains.
    pub fn new_pair() -> (ChannelSender, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSender { tx }, rx)
    }

    pub fn send(&self, frame: String) -> Result<(), RoomError> {
        self.tx
            .send(frame)
            .map_err(|_| RoomError::Transport("channel writer is gone".into()))
    }
}

/// Connect to `url` and start the read/write pump.
///
/// `events` receives `(generation, event)` pairs until the socket dies.
pub async fn open_channel(
    url: &str,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, ChannelEvent)>,
) -> Result<ChannelSender, RoomError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| RoomError::Transport(format!("connect failed: {e}")))?;
    let (mut writer, mut reader) = stream.split();

    let (sender, mut out_rx) = ChannelSender::new_pair();

    // Writer task: forward outbound frames; send a close frame when the
    // room drops its sender.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if writer.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = writer.send(Message::Close(None)).await;
    });

    // Reader task: pump inbound frames and the final close event.
    tokio::spawn(async move {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if events
                        .send((generation, ChannelEvent::Message(text.to_string())))
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let _ = events.send((generation, ChannelEvent::Closed { code, reason }));
                    return;
                }
                Ok(_) => {} // binary / ping / pong frames are not part of the protocol
                Err(e) => {
                    let _ = events.send((generation, ChannelEvent::Error(e.to_string())));
                    let _ = events.send((
                        generation,
                        ChannelEvent::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    ));
                    return;
                }
            }
        }
        let _ = events.send((
            generation,
            ChannelEvent::Closed {
                code: None,
                reason: String::new(),
            },
        ));
    });

    Ok(sender)
}
