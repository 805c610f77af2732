//! Reconnecting push-channel subscriptions.
//!
//! Every page-level subscription is a [`SubscriptionDescriptor`] handed to the
//! shared [`SubscriptionManager`]. The manager returns an explicit
//! [`SubscriptionHandle`]; the handle is the event stream, the state
//! observer and the cancellation point. Channel failures never reach the
//! caller: the supervisor task reconnects with capped exponential backoff
//! for as long as the handle is alive.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffState};
use crate::config::SubscriptionConfig;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// Equality filter on one column, rendered as `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn to_query(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }
}

/// What a view wants to hear about. Immutable once opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    topic: String,
    filter: Option<RowFilter>,
    kinds: BTreeSet<ChangeKind>,
}

impl SubscriptionDescriptor {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            filter: None,
            kinds: BTreeSet::new(),
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn filter(&self) -> Option<&RowFilter> {
        self.filter.as_ref()
    }

    pub fn kinds(&self) -> &BTreeSet<ChangeKind> {
        &self.kinds
    }

    /// An empty interest set means every kind.
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// A row-level change pushed by the realtime service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

pub type ChangeStream = BoxStream<'static, SyncResult<ChangeEvent>>;

/// Opens one push channel for a descriptor. The stream ending or yielding an
/// error is treated as an abnormal close.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, descriptor: &SubscriptionDescriptor) -> SyncResult<ChangeStream>;
}

pub type SubscriptionId = u64;

type Registry = Arc<Mutex<HashMap<SubscriptionId, String>>>;

pub struct SubscriptionManager {
    transport: Arc<dyn PushTransport>,
    config: SubscriptionConfig,
    next_id: AtomicU64,
    registry: Registry,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn PushTransport>, config: SubscriptionConfig) -> Self {
        Self {
            transport,
            config,
            next_id: AtomicU64::new(1),
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Opens a subscription and starts connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, descriptor: SubscriptionDescriptor) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let descriptor = Arc::new(descriptor);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = broadcast::channel(self.config.event_buffer.max(1));
        let live = Arc::new(AtomicBool::new(true));
        let backoff = Arc::new(Mutex::new(Backoff::new(self.config.reconnect).state()));

        self.registry
            .lock()
            .insert(id, descriptor.topic().to_string());

        let supervisor = Supervisor {
            id,
            transport: Arc::clone(&self.transport),
            descriptor: Arc::clone(&descriptor),
            config: self.config.clone(),
            state: Arc::clone(&state_tx),
            backoff: Arc::clone(&backoff),
            events: events_tx,
            live: Arc::clone(&live),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        debug!(
            target = "sync.subscription",
            id,
            topic = %descriptor.topic(),
            "subscription opened"
        );

        SubscriptionHandle {
            id,
            descriptor,
            state: state_rx,
            state_tx,
            backoff,
            events: Some(event_stream(id, events_rx)),
            live,
            shutdown: shutdown_tx,
            task: Some(task),
            forwarder: None,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Intentional, terminal teardown of a subscription.
    pub fn close(&self, handle: SubscriptionHandle) {
        handle.close();
    }

    /// Routes the handle's events to `callback` until the handle is closed.
    pub fn on_event<F>(&self, handle: &mut SubscriptionHandle, callback: F) -> bool
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        handle.on_event(callback)
    }

    pub fn live_subscriptions(&self) -> usize {
        self.registry.lock().len()
    }
}

pub struct SubscriptionHandle {
    id: SubscriptionId,
    descriptor: Arc<SubscriptionDescriptor>,
    state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    backoff: Arc<Mutex<BackoffState>>,
    events: Option<BoxStream<'static, ChangeEvent>>,
    live: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
    registry: Registry,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn descriptor(&self) -> &SubscriptionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn backoff(&self) -> BackoffState {
        *self.backoff.lock()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Next event in channel order. `None` once closed or once the stream was
    /// handed to [`SubscriptionHandle::on_event`].
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        if !self.is_live() {
            return None;
        }
        let events = self.events.as_mut()?;
        events.next().await
    }

    pub fn on_event<F>(&mut self, mut callback: F) -> bool
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let Some(mut events) = self.events.take() else {
            warn!(
                target = "sync.subscription",
                id = self.id,
                "event stream already consumed"
            );
            return false;
        };
        let live = Arc::clone(&self.live);
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if !live.load(Ordering::Acquire) {
                    break;
                }
                callback(event);
            }
        }));
        true
    }

    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.events = None;
        self.state_tx.send_replace(ConnectionState::Closed);
        self.registry.lock().remove(&self.id);
        debug!(
            target = "sync.subscription",
            id = self.id,
            topic = %self.descriptor.topic(),
            "subscription closed"
        );
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Stream for SubscriptionHandle {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.live.load(Ordering::Acquire) {
            return Poll::Ready(None);
        }
        match this.events.as_mut() {
            Some(events) => events.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Reads the handle's bounded buffer. A reader that falls behind loses the
/// oldest events and keeps going from the newest retained one.
fn event_stream(
    id: SubscriptionId,
    rx: broadcast::Receiver<ChangeEvent>,
) -> BoxStream<'static, ChangeEvent> {
    futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(RecvError::Lagged(skipped)) => warn!(
                    target = "sync.subscription",
                    id,
                    skipped,
                    "event reader fell behind, dropped oldest events"
                ),
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

struct Supervisor {
    id: SubscriptionId,
    transport: Arc<dyn PushTransport>,
    descriptor: Arc<SubscriptionDescriptor>,
    config: SubscriptionConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    backoff: Arc<Mutex<BackoffState>>,
    events: broadcast::Sender<ChangeEvent>,
    live: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect);
        let mut next_state = ConnectionState::Connecting;

        loop {
            if !self.is_live() {
                break;
            }
            self.state.send_replace(next_state);

            let connected = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.transport.connect(&self.descriptor),
                ) => result.map_err(SyncError::from).and_then(|inner| inner),
            };

            match connected {
                Ok(stream) => {
                    backoff.reset();
                    *self.backoff.lock() = backoff.state();
                    self.state.send_replace(ConnectionState::Connected);
                    info!(
                        target = "sync.subscription",
                        id = self.id,
                        topic = %self.descriptor.topic(),
                        "push channel connected"
                    );
                    match self.pump(stream).await {
                        Some(err) => warn!(
                            target = "sync.subscription",
                            id = self.id,
                            topic = %self.descriptor.topic(),
                            error = %err,
                            "push channel dropped"
                        ),
                        None => break,
                    }
                }
                Err(err) => {
                    warn!(
                        target = "sync.subscription",
                        id = self.id,
                        topic = %self.descriptor.topic(),
                        error = %err,
                        "push channel connect failed"
                    );
                }
            }

            if !self.is_live() {
                break;
            }
            next_state = ConnectionState::Reconnecting;
            self.state.send_replace(next_state);
            let delay = backoff.next_delay();
            *self.backoff.lock() = backoff.state();
            debug!(
                target = "sync.subscription",
                id = self.id,
                attempt = backoff.state().attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Closed);
    }

    /// Forwards events until the channel fails. Returns `None` on shutdown.
    async fn pump(&mut self, mut stream: ChangeStream) -> Option<SyncError> {
        loop {
            let item = tokio::select! {
                _ = self.shutdown.changed() => return None,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    if !self.is_live() {
                        return None;
                    }
                    if !self.descriptor.accepts(event.kind) {
                        continue;
                    }
                    // No receiver once the stream was dropped; keep the channel
                    // alive until the handle is closed.
                    let _ = self.events.send(event);
                }
                Some(Err(err)) => return Some(err),
                None => return Some(SyncError::Closed),
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}
