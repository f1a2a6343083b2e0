//! Outbound half of a device connection
//!
//! A [`Channel`] is a cheap cloneable handle. Sending only pushes onto an
//! unbounded queue; the socket's writer task drains that queue and performs
//! the actual network I/O, so no caller ever waits on a slow peer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use tether_core::SignalError;

use crate::messages::ServerMessage;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Work items for a socket writer
#[derive(Debug)]
pub enum Outbound {
    /// A protocol message
    Message(ServerMessage),
    /// Transport-level liveness probe (WebSocket ping)
    Probe,
    /// Send a close frame and stop writing
    Close,
}

/// Handle used to reach one connected device
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<Notify>,
}

impl Channel {
    /// Create a channel and the receiver its writer task drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        let channel = Self {
            id,
            tx,
            closed: Arc::new(Notify::new()),
        };
        (channel, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queue a message for the device
    pub fn send(&self, msg: ServerMessage) -> Result<(), SignalError> {
        self.tx
            .send(Outbound::Message(msg))
            .map_err(|_| SignalError::ChannelUnavailable)
    }

    /// Queue a liveness probe
    pub fn probe(&self) -> Result<(), SignalError> {
        self.tx
            .send(Outbound::Probe)
            .map_err(|_| SignalError::ChannelUnavailable)
    }

    /// Ask the writer to close the socket and wake the reader loop.
    ///
    /// Messages queued before the close are still written first.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
        self.closed.notify_one();
    }

    /// Resolves once [`Channel::close`] has been called on any clone
    pub async fn closed(&self) {
        self.closed.notified().await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}
