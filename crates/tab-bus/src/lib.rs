//! Origin-scoped broadcast bus.
//!
//! Every client instance ("tab") of one origin joins the bus under its own id.
//! A message posted on a channel reaches every other instance listening on
//! that channel, never the poster itself.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub sender: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes to every current subscriber of `channel` and returns how many
    /// receivers saw the message. Publishing to an empty channel is not an error.
    fn publish(&self, channel: &str, sender: &str, payload: Bytes) -> BusResult<usize>;
}

/// In-memory bus for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.channels.read().get(channel) {
            return sender.clone();
        }
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, sender: &str, payload: Bytes) -> BusResult<usize> {
        let tx = self.sender_for(channel);
        match tx.send(BusMessage {
            channel: channel.to_string(),
            sender: sender.to_string(),
            payload,
        }) {
            Ok(receivers) => Ok(receivers),
            // No listeners right now; BroadcastChannel semantics drop the message.
            Err(_) => Ok(0),
        }
    }
}

/// One instance's membership on a shared bus.
pub struct TabPort<B: Bus> {
    bus: Arc<B>,
    tab_id: String,
}

impl<B: Bus> TabPort<B> {
    pub fn join(bus: Arc<B>, tab_id: impl Into<String>) -> Self {
        Self {
            bus,
            tab_id: tab_id.into(),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn post(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        self.bus.publish(channel, &self.tab_id, payload)
    }

    /// Listens on `channel`, skipping messages this instance posted itself.
    pub fn listen(&self, channel: &str) -> TabReceiver {
        TabReceiver {
            rx: self.bus.subscribe(channel),
            tab_id: self.tab_id.clone(),
        }
    }
}

impl<B: Bus> Clone for TabPort<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            tab_id: self.tab_id.clone(),
        }
    }
}

pub struct TabReceiver {
    rx: broadcast::Receiver<BusMessage>,
    tab_id: String,
}

impl TabReceiver {
    pub async fn recv(&mut self) -> BusResult<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.sender == self.tab_id => continue,
                Ok(msg) => return Ok(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        target = "tab.bus",
                        tab = %self.tab_id,
                        skipped,
                        "tab receiver lagged"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}
