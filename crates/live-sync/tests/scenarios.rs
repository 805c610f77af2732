use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use live_sync::command::{CommandEndpoint, CommandRequest, CommandResponse};
use live_sync::config::{CommandConfig, PollingConfig, SubscriptionConfig, TokenConfig};
use live_sync::polling::{poll_fn, PollRequest, PollResponse};
use live_sync::subscription::{ChangeStream, PushTransport};
use live_sync::token::store::{MemoryStore, Tier, TokenStore};
use live_sync::{
    Action, ActivityKind, BackoffPolicy, ConnectionState, ErrorKind, IdleMonitor, LocalView,
    Patch, PollingController, SharedToken, SubscriptionDescriptor, SubscriptionManager,
    SyncError, SyncResult, TickSnapshot, TokenSynchronizer, ViewEvent,
};
use live_sync::{CommandPipeline, TokenProvider};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tab_bus::{LocalBus, TabPort};
use tokio::sync::Notify;

fn snapshot(tick: u64) -> TickSnapshot {
    TickSnapshot {
        tick,
        tick_interval_ms: 10_000,
        phase: "siege".into(),
        scores: json!({ "red": tick * 10, "blue": tick * 7 }),
        resources: json!({ "gold": 1_000 - tick }),
        map: Value::Null,
        next_tick_in_ms: None,
    }
}

fn response(tick: u64) -> PollResponse {
    PollResponse {
        snapshot: snapshot(tick),
        log: Vec::new(),
    }
}

fn polling_config(cadence: Duration) -> PollingConfig {
    PollingConfig {
        cadence,
        request_timeout: Duration::from_secs(5),
        degraded_after: 3,
        idle_threshold: Duration::from_secs(300),
    }
}

fn command_config() -> CommandConfig {
    CommandConfig {
        max_attempts: 3,
        retry: BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(2)),
        request_timeout: Duration::from_secs(8),
        repoll_within: Duration::from_millis(300),
    }
}

fn token_config() -> TokenConfig {
    TokenConfig {
        freshness: Duration::from_secs(1800),
        lock_window: Duration::from_secs(2),
        durable_path: None,
        channel: "live-sync.token".into(),
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn late_older_tick_never_replaces_newer() {
    let calls = Arc::new(AtomicU32::new(0));
    let source = {
        let calls = Arc::clone(&calls);
        poll_fn(move |_request: PollRequest| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Ok(response(5)),
                    1 => {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        Ok(response(4))
                    }
                    _ => Ok(response(5)),
                }
            }
        })
    };
    let controller = PollingController::new(
        Arc::new(source),
        IdleMonitor::new(Duration::from_secs(300)),
        polling_config(Duration::from_secs(1)),
    );
    let mut handle = controller.start(Duration::from_secs(10));

    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(calls.load(Ordering::SeqCst) >= 5);
    assert_eq!(handle.latest_tick(), Some(5));

    let mut snapshots = Vec::new();
    while let Some(event) = handle.try_next_event() {
        match event {
            ViewEvent::Snapshot(snapshot) => snapshots.push(snapshot.tick),
            ViewEvent::TickBoundary { .. } => panic!("no boundary expected"),
            _ => {}
        }
    }
    assert_eq!(snapshots, vec![5]);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn idle_suspends_then_activity_polls_once_and_resumes_cadence() {
    let calls = Arc::new(AtomicU32::new(0));
    let source = {
        let calls = Arc::clone(&calls);
        poll_fn(move |_request: PollRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(response(10)) }
        })
    };
    let idle = IdleMonitor::new(Duration::from_secs(10));
    let controller = PollingController::new(
        Arc::new(source),
        idle.clone(),
        polling_config(Duration::from_secs(1)),
    );
    let mut handle = controller.start(Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(60)).await;
    // Polls at t=0..=9; the step at t=10 finds the monitor past its threshold.
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert!(idle.is_suspended());
    let events: Vec<ViewEvent> = std::iter::from_fn(|| handle.try_next_event()).collect();
    assert_eq!(events.last(), Some(&ViewEvent::Suspended));
    assert_eq!(handle.latest_tick(), Some(10));

    idle.record_activity(ActivityKind::Pointer);
    settle().await;
    assert_eq!(handle.try_next_event(), Some(ViewEvent::Resumed));
    assert_eq!(calls.load(Ordering::SeqCst), 11);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 11);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 12);
}

enum Reply {
    Now(SyncResult<CommandResponse>),
    After(Arc<Notify>, SyncResult<CommandResponse>),
}

#[derive(Default)]
struct FakeEndpoint {
    replies: Mutex<Vec<Reply>>,
    seen: Mutex<Vec<(CommandRequest, String)>>,
}

impl FakeEndpoint {
    fn new(mut replies: Vec<Reply>) -> Arc<Self> {
        replies.reverse();
        Arc::new(Self {
            replies: Mutex::new(replies),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CommandEndpoint for FakeEndpoint {
    async fn send(
        &self,
        request: &CommandRequest,
        credential: &SharedToken,
    ) -> SyncResult<CommandResponse> {
        self.seen
            .lock()
            .push((request.clone(), credential.value.clone()));
        let reply = self.replies.lock().pop();
        match reply {
            Some(Reply::Now(result)) => result,
            Some(Reply::After(gate, result)) => {
                gate.notified().await;
                result
            }
            None => Err(SyncError::Transport("no reply scripted".into())),
        }
    }
}

struct StaticTokens(SharedToken);

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn get_token(&self) -> Option<SharedToken> {
        Some(self.0.clone())
    }

    async fn rotate(&self) -> SharedToken {
        self.0.clone()
    }
}

fn static_tokens() -> Arc<StaticTokens> {
    Arc::new(StaticTokens(SharedToken::generate(Duration::from_secs(600))))
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn confirmed_command_pulls_the_next_poll_forward() {
    let calls = Arc::new(AtomicU32::new(0));
    let source = {
        let calls = Arc::clone(&calls);
        poll_fn(move |_request: PollRequest| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(response(1 + u64::from(n))) }
        })
    };
    let view = LocalView::default();
    let handle = PollingController::new(
        Arc::new(source),
        IdleMonitor::new(Duration::from_secs(300)),
        polling_config(Duration::from_secs(30)),
    )
    .with_view(view.clone())
    .start(Duration::from_secs(10));
    settle().await;
    assert_eq!(view.get("/tick"), Some(json!(1)));

    let endpoint = FakeEndpoint::new(vec![Reply::Now(Ok(CommandResponse {
        accepted: true,
        detail: None,
        state: Some(json!({ "resources": { "gold": 900 } })),
    }))]);
    let pipeline = CommandPipeline::new(endpoint, static_tokens(), view.clone(), command_config())
        .with_repoller(handle.repoller());

    let outcome = pipeline
        .submit(&Action::new("recruit").on("keep"), json!({ "count": 1 }))
        .await;
    assert!(outcome.is_ok());
    assert_eq!(view.get("/resources/gold"), Some(json!(900)));

    tokio::time::sleep(Duration::from_millis(310)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(handle.latest_tick(), Some(2));
    assert_eq!(view.get("/tick"), Some(json!(2)));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn rejection_restores_latest_authoritative_state() {
    let tick = Arc::new(AtomicU32::new(1));
    let source = {
        let tick = Arc::clone(&tick);
        poll_fn(move |_request: PollRequest| {
            let current = u64::from(tick.load(Ordering::SeqCst));
            async move { Ok(response(current)) }
        })
    };
    let view = LocalView::default();
    let handle = PollingController::new(
        Arc::new(source),
        IdleMonitor::new(Duration::from_secs(300)),
        polling_config(Duration::from_secs(1)),
    )
    .with_view(view.clone())
    .start(Duration::from_secs(10));
    settle().await;

    let gate = Arc::new(Notify::new());
    let endpoint = FakeEndpoint::new(vec![Reply::After(
        Arc::clone(&gate),
        Err(SyncError::Rejected("insufficient gold".into())),
    )]);
    let pipeline =
        CommandPipeline::new(endpoint.clone(), static_tokens(), view.clone(), command_config());
    pipeline.register_optimistic("build", |payload, _view| {
        Some(Patch::new().set("/resources/gold", json!(0)).set(
            format!("/map/{}", payload["slot"].as_str()?),
            json!("tower"),
        ))
    });

    let action = Action::new("build").on("slot-3");
    let submit = pipeline.submit(&action, json!({ "slot": "slot-3" }));
    let meanwhile = async {
        settle().await;
        assert_eq!(view.get("/resources/gold"), Some(json!(0)));
        // The server moves on while the command is pending.
        tick.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(view.get("/resources/gold"), Some(json!(0)));
        gate.notify_one();
    };
    let (outcome, ()) = tokio::join!(submit, meanwhile);

    assert_eq!(outcome.failure_kind(), Some(ErrorKind::Rejected));
    assert_eq!(endpoint.seen.lock().len(), 1);
    let authoritative = serde_json::to_value(handle.latest().expect("snapshot")).unwrap();
    assert_eq!(authoritative["tick"], json!(2));
    assert_eq!(view.snapshot(), authoritative);
}

#[test_timeout::tokio_timeout_test(10)]
async fn credential_rotation_reaches_every_tab() {
    let bus = Arc::new(LocalBus::new());
    let shared = MemoryStore::shared();
    let durable = MemoryStore::new(Tier::Durable);
    let tiers = |shared: &MemoryStore, durable: &MemoryStore| -> Vec<Arc<dyn TokenStore>> {
        vec![
            Arc::new(MemoryStore::session()),
            Arc::new(shared.clone()),
            Arc::new(durable.clone()),
        ]
    };
    let tab_a = Arc::new(TokenSynchronizer::new(
        TabPort::join(Arc::clone(&bus), "tab-a"),
        tiers(&shared, &durable),
        token_config(),
    ));
    let tab_b = TokenSynchronizer::new(
        TabPort::join(Arc::clone(&bus), "tab-b"),
        tiers(&shared, &durable),
        token_config(),
    );
    let first = tab_a.rotate().await;
    settle().await;
    assert_eq!(tab_b.get_token().await, Some(first.clone()));

    let endpoint = FakeEndpoint::new(vec![
        Reply::Now(Err(SyncError::CredentialInvalid("token expired".into()))),
        Reply::Now(Ok(CommandResponse {
            accepted: true,
            detail: None,
            state: None,
        })),
    ]);
    // Tab B's receipt started a lock window; tab A is free to rotate.
    let pipeline = CommandPipeline::new(
        endpoint.clone(),
        Arc::clone(&tab_a) as Arc<dyn TokenProvider>,
        LocalView::default(),
        command_config(),
    );
    let outcome = pipeline
        .submit(&Action::new("vote").on("alliance-9"), json!({ "choice": "war" }))
        .await;
    assert!(outcome.is_ok());
    settle().await;

    let seen = endpoint.seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0.idempotency_token, seen[1].0.idempotency_token);
    assert_eq!(seen[0].1, first.value);
    let rotated = tab_a.current().expect("tab a token");
    assert_ne!(rotated, first);
    assert_eq!(seen[1].1, rotated.value);
    assert_eq!(tab_b.get_token().await, Some(rotated.clone()));
    assert_eq!(shared.peek(), Some(rotated));
}

#[test_timeout::tokio_timeout_test(10)]
async fn tabs_rotating_together_share_one_value() {
    let bus = Arc::new(LocalBus::new());
    let shared = MemoryStore::shared();
    let tabs: Vec<TokenSynchronizer<LocalBus>> = (0..3)
        .map(|n| {
            let tiers: Vec<Arc<dyn TokenStore>> =
                vec![Arc::new(MemoryStore::session()), Arc::new(shared.clone())];
            TokenSynchronizer::new(
                TabPort::join(Arc::clone(&bus), format!("tab-{n}")),
                tiers,
                token_config(),
            )
        })
        .collect();

    let rotated = futures::future::join_all(tabs.iter().map(|tab| tab.rotate())).await;
    settle().await;

    let values: Vec<SharedToken> = tabs.iter().filter_map(|tab| tab.current()).collect();
    assert_eq!(values.len(), 3);
    assert!(values.iter().all(|value| *value == values[0]));
    assert!(rotated.contains(&values[0]));
    assert_eq!(shared.peek().as_ref(), Some(&values[0]));
}

struct RefusingTransport {
    attempts: AtomicU32,
}

#[async_trait]
impl PushTransport for RefusingTransport {
    async fn connect(&self, _descriptor: &SubscriptionDescriptor) -> SyncResult<ChangeStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::Transport("connection refused".into()))
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn closing_during_backoff_stops_everything() {
    let transport = Arc::new(RefusingTransport {
        attempts: AtomicU32::new(0),
    });
    let manager = SubscriptionManager::new(
        transport.clone(),
        SubscriptionConfig {
            reconnect: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            event_buffer: 64,
        },
    );
    let mut handle = manager.open(SubscriptionDescriptor::new("battle_units"));
    let callbacks = Arc::new(AtomicU32::new(0));
    {
        let callbacks = Arc::clone(&callbacks);
        handle.on_event(move |_| {
            callbacks.fetch_add(1, Ordering::SeqCst);
        });
    }

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(handle.state(), ConnectionState::Reconnecting);
    let attempts = transport.attempts.load(Ordering::SeqCst);
    assert_eq!(attempts, 3);

    manager.close(handle);
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(transport.attempts.load(Ordering::SeqCst), attempts);
    assert_eq!(callbacks.load(Ordering::SeqCst), 0);
    assert_eq!(manager.live_subscriptions(), 0);
}
