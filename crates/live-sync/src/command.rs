//! Idempotent command submission with optimistic local updates.
//!
//! One idempotency token per logical action, reused by every retry. A second
//! submission of an action that is still pending joins the in-flight one
//! instead of reaching the endpoint.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::CommandConfig;
use crate::error::{ErrorKind, Outcome, SyncError, SyncResult};
use crate::polling::Repoller;
use crate::token::{SharedToken, TokenProvider};
use crate::view::{LocalView, Patch, PatchId};

/// A player intent: a kind plus the thing it acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    kind: String,
    target: Option<String>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: None,
        }
    }

    pub fn on(mut self, target: impl ToString) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn key(&self) -> ActionKey {
        match &self.target {
            Some(target) => ActionKey(format!("{}:{}", self.kind, target)),
            None => ActionKey(self.kind.clone()),
        }
    }
}

/// Identity used to coalesce repeated submissions of the same action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey(String);

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRequest {
    pub idempotency_token: Uuid,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub accepted: bool,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub state: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub token: Uuid,
    pub attempts: u32,
    pub detail: Option<String>,
    pub state: Option<Value>,
}

pub type CommandOutcome = Outcome<CommandReceipt>;

/// Bookkeeping for one submitted action, alive until a terminal response.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub token: Uuid,
    pub key: ActionKey,
    pub payload: Value,
    pub submitted_at: Instant,
    pub retries: u32,
}

#[async_trait]
pub trait CommandEndpoint: Send + Sync {
    async fn send(
        &self,
        request: &CommandRequest,
        credential: &SharedToken,
    ) -> SyncResult<CommandResponse>;
}

/// Guesses the effect of an action from its payload and the current view.
pub type OptimisticTransform = Arc<dyn Fn(&Value, &Value) -> Option<Patch> + Send + Sync>;

struct InFlight {
    command: PendingCommand,
    status: watch::Receiver<Option<CommandOutcome>>,
}

pub struct CommandPipeline {
    endpoint: Arc<dyn CommandEndpoint>,
    tokens: Arc<dyn TokenProvider>,
    view: LocalView,
    config: CommandConfig,
    repoller: Option<Repoller>,
    transforms: RwLock<HashMap<String, OptimisticTransform>>,
    in_flight: Mutex<HashMap<ActionKey, InFlight>>,
    pending: watch::Sender<BTreeSet<ActionKey>>,
}

impl CommandPipeline {
    pub fn new(
        endpoint: Arc<dyn CommandEndpoint>,
        tokens: Arc<dyn TokenProvider>,
        view: LocalView,
        config: CommandConfig,
    ) -> Self {
        let (pending, _) = watch::channel(BTreeSet::new());
        Self {
            endpoint,
            tokens,
            view,
            config,
            repoller: None,
            transforms: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pending,
        }
    }

    /// Confirmed commands ask this poller to catch up within
    /// `CommandConfig::repoll_within`.
    pub fn with_repoller(mut self, repoller: Repoller) -> Self {
        self.repoller = Some(repoller);
        self
    }

    pub fn register_optimistic<F>(&self, kind: impl Into<String>, transform: F)
    where
        F: Fn(&Value, &Value) -> Option<Patch> + Send + Sync + 'static,
    {
        self.transforms
            .write()
            .insert(kind.into(), Arc::new(transform));
    }

    pub fn view(&self) -> &LocalView {
        &self.view
    }

    pub fn is_pending(&self, key: &ActionKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn pending_command(&self, key: &ActionKey) -> Option<PendingCommand> {
        self.in_flight
            .lock()
            .get(key)
            .map(|entry| entry.command.clone())
    }

    /// Keys with a submission in flight; drives disabling the triggering
    /// controls.
    pub fn watch_pending(&self) -> watch::Receiver<BTreeSet<ActionKey>> {
        self.pending.subscribe()
    }

    /// Progress of one in-flight action, including `Retrying` steps.
    pub fn watch_command(
        &self,
        key: &ActionKey,
    ) -> Option<watch::Receiver<Option<CommandOutcome>>> {
        self.in_flight
            .lock()
            .get(key)
            .map(|entry| entry.status.clone())
    }

    pub async fn submit(&self, action: &Action, payload: Value) -> CommandOutcome {
        let key = action.key();
        let joined = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(entry) => Err(entry.status.clone()),
                None => {
                    let (status_tx, status_rx) = watch::channel(None);
                    let command = PendingCommand {
                        token: Uuid::new_v4(),
                        key: key.clone(),
                        payload: payload.clone(),
                        submitted_at: Instant::now(),
                        retries: 0,
                    };
                    in_flight.insert(key.clone(), InFlight {
                        command: command.clone(),
                        status: status_rx,
                    });
                    Ok((command, status_tx))
                }
            }
        };

        let (command, status) = match joined {
            Ok(fresh) => fresh,
            Err(status) => {
                debug!(target = "sync.command", key = %key, "coalescing duplicate submission");
                return await_terminal(status).await;
            }
        };
        self.pending.send_modify(|pending| {
            pending.insert(key.clone());
        });

        let mut guard = Settle {
            pipeline: self,
            key,
            patch: None,
            settled: false,
        };
        let outcome = self.drive(action, command, &status, &mut guard).await;
        guard.settled = true;
        status.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn drive(
        &self,
        action: &Action,
        command: PendingCommand,
        status: &watch::Sender<Option<CommandOutcome>>,
        guard: &mut Settle<'_>,
    ) -> CommandOutcome {
        let transform = self.transforms.read().get(action.kind()).cloned();
        if let Some(transform) = transform {
            let current = self.view.snapshot();
            if let Some(patch) = transform(&command.payload, &current).filter(|p| !p.is_empty()) {
                guard.patch = Some(self.view.apply(patch));
            }
        }

        let request = CommandRequest {
            idempotency_token: command.token,
            action: action.kind().to_string(),
            target: action.target().map(str::to_string),
            payload: command.payload,
        };

        let mut credential = match self.tokens.get_token().await {
            Some(token) => token,
            None => {
                debug!(target = "sync.command", "no fresh token, rotating before submit");
                self.tokens.rotate().await
            }
        };

        let mut backoff = Backoff::new(self.config.retry);
        let mut attempts = 0u32;
        let mut rotated = false;

        loop {
            attempts += 1;
            let result = tokio::time::timeout(
                self.config.request_timeout,
                self.endpoint.send(&request, &credential),
            )
            .await
            .map_err(SyncError::from)
            .and_then(|inner| inner)
            .and_then(|response| {
                if response.accepted {
                    Ok(response)
                } else {
                    Err(SyncError::Rejected(
                        response
                            .detail
                            .unwrap_or_else(|| "command not accepted".to_string()),
                    ))
                }
            });

            let err = match result {
                Ok(response) => {
                    self.confirm(guard.patch.take(), response.state.as_ref());
                    info!(
                        target = "sync.command",
                        key = %guard.key,
                        token = %request.idempotency_token,
                        attempts,
                        "command confirmed"
                    );
                    return Outcome::Ok(CommandReceipt {
                        token: request.idempotency_token,
                        attempts,
                        detail: response.detail,
                        state: response.state,
                    });
                }
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::CredentialInvalid if !rotated => {
                    rotated = true;
                    info!(
                        target = "sync.command",
                        key = %guard.key,
                        "credential rejected, rotating"
                    );
                    credential = self.tokens.rotate().await;
                    continue;
                }
                ErrorKind::TransientTransport
                    if attempts < self.config.max_attempts + u32::from(rotated) =>
                {
                    let delay = backoff.next_delay();
                    warn!(
                        target = "sync.command",
                        key = %guard.key,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "command attempt failed, retrying"
                    );
                    self.note_retry(&guard.key);
                    status.send_replace(Some(Outcome::Retrying {
                        attempt: attempts,
                        kind: ErrorKind::TransientTransport,
                    }));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                _ => {}
            }

            // A second credential failure counts as a rejection.
            let kind = match err.kind() {
                ErrorKind::CredentialInvalid => ErrorKind::Rejected,
                kind => kind,
            };
            if let Some(patch) = guard.patch.take() {
                self.view.rollback(patch);
            }
            warn!(
                target = "sync.command",
                key = %guard.key,
                token = %request.idempotency_token,
                attempts,
                ?kind,
                error = %err,
                "command failed"
            );
            return Outcome::Failed {
                kind,
                detail: err.to_string(),
            };
        }
    }

    fn confirm(&self, patch: Option<PatchId>, state: Option<&Value>) {
        match (patch, state) {
            (Some(patch), state) => self.view.reconcile(patch, state),
            (None, Some(state)) => self.view.merge(state),
            (None, None) => {}
        }
        if let Some(repoller) = &self.repoller {
            repoller.repoll_within(self.config.repoll_within);
        }
    }

    fn note_retry(&self, key: &ActionKey) {
        if let Some(entry) = self.in_flight.lock().get_mut(key) {
            entry.command.retries += 1;
        }
    }

    fn release(&self, key: &ActionKey) {
        self.in_flight.lock().remove(key);
        self.pending.send_modify(|pending| {
            pending.remove(key);
        });
    }
}

/// Clears the in-flight entry however `submit` ends, including when the
/// caller drops the future mid-flight.
struct Settle<'a> {
    pipeline: &'a CommandPipeline,
    key: ActionKey,
    patch: Option<PatchId>,
    settled: bool,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            if let Some(patch) = self.patch.take() {
                self.pipeline.view.rollback(patch);
            }
            debug!(target = "sync.command", key = %self.key, "submission abandoned");
        }
        self.pipeline.release(&self.key);
    }
}

async fn await_terminal(mut status: watch::Receiver<Option<CommandOutcome>>) -> CommandOutcome {
    let terminal = status
        .wait_for(|outcome| outcome.as_ref().is_some_and(Outcome::is_terminal))
        .await
        .ok()
        .and_then(|outcome| outcome.clone());
    terminal.unwrap_or_else(|| Outcome::Failed {
        kind: ErrorKind::TransientTransport,
        detail: "submission abandoned".to_string(),
    })
}
