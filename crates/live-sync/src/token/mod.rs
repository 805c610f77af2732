//! Cross-instance token synchronizer.
//!
//! One freshness-bounded credential per origin, replicated into session,
//! shared and durable tiers and kept consistent across instances through
//! the tab bus. Rotations are broadcast once; receivers adopt, never
//! re-broadcast, and hold a short lock window so two instances do not
//! rotate on top of each other. When rotations race, the later `issued_at`
//! wins everywhere (ties go to the larger value).

pub mod store;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tab_bus::{Bus, TabPort};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TokenConfig;
use store::{Tier, TokenStore};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedToken {
    pub value: String,
    /// Wall-clock issue time, unix milliseconds.
    pub issued_at_ms: u64,
    pub freshness_ms: u64,
}

impl SharedToken {
    pub fn generate(freshness: Duration) -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            value: URL_SAFE_NO_PAD.encode(bytes),
            issued_at_ms: unix_millis(),
            freshness_ms: freshness.as_millis() as u64,
        }
    }

    pub fn is_fresh_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.issued_at_ms) < self.freshness_ms
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(unix_millis())
    }

    pub fn is_well_formed(&self) -> bool {
        self.issued_at_ms > 0
            && self.freshness_ms > 0
            && URL_SAFE_NO_PAD
                .decode(self.value.as_bytes())
                .is_ok_and(|raw| raw.len() == TOKEN_BYTES)
    }

    /// Total order used to settle racing rotations.
    pub fn supersedes(&self, other: &SharedToken) -> bool {
        (self.issued_at_ms, self.value.as_str()) > (other.issued_at_ms, other.value.as_str())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Unset,
    Fresh,
    Stale,
}

#[derive(Debug, Serialize, Deserialize)]
struct RotationNotice {
    origin: String,
    token: SharedToken,
    /// Value the sender held when it rotated. A notice replacing our own
    /// value is a deliberate successor, not a racing rotation.
    #[serde(default)]
    replaces: Option<String>,
}

/// What the command path needs from the synchronizer.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A fresh token, or `None` meaning "go rotate".
    async fn get_token(&self) -> Option<SharedToken>;

    async fn rotate(&self) -> SharedToken;
}

type RotationCallback = Box<dyn Fn(&SharedToken) + Send + Sync>;

struct Inner<B: Bus> {
    port: TabPort<B>,
    tiers: Vec<Arc<dyn TokenStore>>,
    config: TokenConfig,
    current: Mutex<Option<SharedToken>>,
    lock_until: Mutex<Option<Instant>>,
    gate: tokio::sync::Mutex<()>,
    rotations: broadcast::Sender<SharedToken>,
    callbacks: Mutex<Vec<RotationCallback>>,
}

pub struct TokenSynchronizer<B: Bus + 'static> {
    inner: Arc<Inner<B>>,
    listener: JoinHandle<()>,
}

impl<B: Bus + 'static> TokenSynchronizer<B> {
    /// Tiers are read in the given order; put the session tier first.
    /// Must be called from within a tokio runtime.
    pub fn new(port: TabPort<B>, tiers: Vec<Arc<dyn TokenStore>>, config: TokenConfig) -> Self {
        let (rotations, _) = broadcast::channel(16);
        let mut rx = port.listen(&config.channel);
        let inner = Arc::new(Inner {
            port,
            tiers,
            config,
            current: Mutex::new(None),
            lock_until: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
            rotations,
            callbacks: Mutex::new(Vec::new()),
        });

        let listener = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => inner.receive(&message.sender, &message.payload).await,
                        Err(err) => {
                            debug!(target = "sync.token", error = %err, "token bus closed");
                            break;
                        }
                    }
                }
            })
        };

        Self { inner, listener }
    }

    pub fn tab_id(&self) -> &str {
        self.inner.port.tab_id()
    }

    pub async fn get_token(&self) -> Option<SharedToken> {
        self.inner.get_token().await
    }

    pub async fn rotate(&self) -> SharedToken {
        self.inner.rotate().await
    }

    pub fn on_rotated<F>(&self, callback: F)
    where
        F: Fn(&SharedToken) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().push(Box::new(callback));
    }

    pub fn subscribe_rotations(&self) -> broadcast::Receiver<SharedToken> {
        self.inner.rotations.subscribe()
    }

    pub async fn clear(&self) {
        let _gate = self.inner.gate.lock().await;
        for store in &self.inner.tiers {
            if let Err(err) = store.clear().await {
                warn!(
                    target = "sync.token",
                    tier = ?store.tier(),
                    error = %err,
                    "token tier clear failed"
                );
            }
        }
        *self.inner.current.lock() = None;
        *self.inner.lock_until.lock() = None;
        info!(target = "sync.token", tab = %self.tab_id(), "token cleared");
    }

    /// State of the value this instance last saw.
    pub fn state(&self) -> TokenState {
        match self.inner.current.lock().as_ref() {
            None => TokenState::Unset,
            Some(token) if token.is_fresh() => TokenState::Fresh,
            Some(_) => TokenState::Stale,
        }
    }

    pub fn current(&self) -> Option<SharedToken> {
        self.inner.current.lock().clone()
    }
}

impl<B: Bus + 'static> Drop for TokenSynchronizer<B> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl<B: Bus + 'static> TokenProvider for TokenSynchronizer<B> {
    async fn get_token(&self) -> Option<SharedToken> {
        self.inner.get_token().await
    }

    async fn rotate(&self) -> SharedToken {
        self.inner.rotate().await
    }
}

impl<B: Bus> Inner<B> {
    async fn get_token(&self) -> Option<SharedToken> {
        for (index, store) in self.tiers.iter().enumerate() {
            let token = match store.load().await {
                Ok(Some(token)) => token,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        target = "sync.token",
                        tier = ?store.tier(),
                        error = %err,
                        "token tier unreadable"
                    );
                    continue;
                }
            };
            if !token.is_well_formed() || !token.is_fresh() {
                continue;
            }
            if index > 0 {
                self.backfill_session(&token).await;
            }
            *self.current.lock() = Some(token.clone());
            return Some(token);
        }
        None
    }

    async fn rotate(&self) -> SharedToken {
        let _gate = self.gate.lock().await;
        let previous = self.current.lock().clone();
        if self.within_lock_window() {
            if let Some(token) = previous.clone().filter(SharedToken::is_fresh) {
                debug!(
                    target = "sync.token",
                    tab = %self.port.tab_id(),
                    "rotation suppressed by lock window"
                );
                return token;
            }
        }

        let token = SharedToken::generate(self.config.freshness);
        self.install(&token).await;
        let notice = RotationNotice {
            origin: self.port.tab_id().to_string(),
            token: token.clone(),
            replaces: previous.map(|previous| previous.value),
        };
        match serde_json::to_vec(&notice) {
            Ok(payload) => match self.port.post(&self.config.channel, Bytes::from(payload)) {
                Ok(peers) => info!(
                    target = "sync.token",
                    tab = %self.port.tab_id(),
                    peers,
                    "token rotated"
                ),
                Err(err) => warn!(target = "sync.token", error = %err, "token broadcast failed"),
            },
            Err(err) => warn!(target = "sync.token", error = %err, "token notice not encodable"),
        }
        token
    }

    async fn receive(&self, sender: &str, payload: &[u8]) {
        let notice: RotationNotice = match serde_json::from_slice(payload) {
            Ok(notice) => notice,
            Err(err) => {
                warn!(
                    target = "sync.token",
                    sender,
                    error = %err,
                    "ignoring malformed token broadcast"
                );
                return;
            }
        };
        if !notice.token.is_well_formed() {
            warn!(target = "sync.token", sender, "ignoring invalid token broadcast");
            return;
        }

        let _gate = self.gate.lock().await;
        let current = self.current.lock().clone();
        match current {
            Some(current) if current == notice.token => {}
            Some(current)
                if notice.replaces.as_deref() != Some(current.value.as_str())
                    && current.supersedes(&notice.token) =>
            {
                debug!(
                    target = "sync.token",
                    origin = %notice.origin,
                    "keeping newer local token over broadcast"
                );
                self.write_tiers(&current).await;
            }
            _ => {
                debug!(target = "sync.token", origin = %notice.origin, "adopting broadcast token");
                self.install(&notice.token).await;
                *self.lock_until.lock() = Some(Instant::now() + self.config.lock_window);
            }
        }
    }

    async fn install(&self, token: &SharedToken) {
        self.write_tiers(token).await;
        *self.current.lock() = Some(token.clone());
        let _ = self.rotations.send(token.clone());
        for callback in self.callbacks.lock().iter() {
            callback(token);
        }
    }

    async fn write_tiers(&self, token: &SharedToken) {
        for store in &self.tiers {
            if let Err(err) = store.save(token).await {
                warn!(
                    target = "sync.token",
                    tier = ?store.tier(),
                    error = %err,
                    "token tier write failed"
                );
            }
        }
    }

    async fn backfill_session(&self, token: &SharedToken) {
        for store in self.tiers.iter().filter(|store| store.tier() == Tier::Session) {
            if let Err(err) = store.save(token).await {
                warn!(target = "sync.token", error = %err, "session tier backfill failed");
            }
        }
    }

    fn within_lock_window(&self) -> bool {
        self.lock_until
            .lock()
            .is_some_and(|until| Instant::now() < until)
    }
}
