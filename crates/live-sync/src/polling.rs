//! Tick-bounded polling for views that mirror the server's simulation clock.
//!
//! The controller polls on a short fixed cadence, independent of the tick
//! length, and only surfaces a snapshot when the observed tick moves
//! forward. Responses may overlap and arrive out of order; the tick and the
//! request sequence decide what is kept.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::error::{SyncError, SyncResult};
use crate::idle::IdleMonitor;
use crate::view::LocalView;

/// Authoritative full state at one tick. Replaces, never merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSnapshot {
    pub tick: u64,
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub scores: Value,
    #[serde(default)]
    pub resources: Value,
    #[serde(default)]
    pub map: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_tick_in_ms: Option<u64>,
}

impl TickSnapshot {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Time until the next tick as reported by the server, or a full interval.
    pub fn next_tick_in(&self) -> Duration {
        self.next_tick_in_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.tick_interval())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub tick: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollRequest {
    /// Last accepted tick, if any.
    pub since: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub snapshot: TickSnapshot,
    #[serde(default)]
    pub log: Vec<LogEntry>,
}

#[async_trait]
pub trait PollSource: Send + Sync {
    async fn poll(&self, request: PollRequest) -> SyncResult<PollResponse>;
}

/// Adapts an async closure into a [`PollSource`].
pub struct PollFn<F>(F);

pub fn poll_fn<F, Fut>(f: F) -> PollFn<F>
where
    F: Fn(PollRequest) -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<PollResponse>> + Send,
{
    PollFn(f)
}

#[async_trait]
impl<F, Fut> PollSource for PollFn<F>
where
    F: Fn(PollRequest) -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<PollResponse>> + Send,
{
    async fn poll(&self, request: PollRequest) -> SyncResult<PollResponse> {
        (self.0)(request).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Snapshot(TickSnapshot),
    TickBoundary { previous: u64, current: u64 },
    Log(LogEntry),
    Suspended,
    Resumed,
    Degraded { consecutive_failures: u32 },
    Recovered,
}

/// Requests a poll no later than a given delay. Cheap to clone; requests
/// coalesce to the earliest deadline.
#[derive(Clone, Default)]
pub struct Repoller {
    inner: Arc<RepollInner>,
}

#[derive(Default)]
struct RepollInner {
    deadline: Mutex<Option<Instant>>,
    notify: Notify,
}

impl Repoller {
    pub fn repoll_within(&self, within: Duration) {
        let at = Instant::now() + within;
        let mut deadline = self.inner.deadline.lock();
        if deadline.map_or(true, |current| at < current) {
            *deadline = Some(at);
            drop(deadline);
            self.inner.notify.notify_one();
        }
    }

    pub fn pending(&self) -> Option<Instant> {
        *self.inner.deadline.lock()
    }

    fn clear(&self) {
        *self.inner.deadline.lock() = None;
    }

    async fn due(&self) {
        loop {
            let deadline = *self.inner.deadline.lock();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        _ = self.inner.notify.notified() => {}
                    }
                }
                None => self.inner.notify.notified().await,
            }
        }
    }
}

struct Shared {
    latest: Option<TickSnapshot>,
    next_tick_at: Instant,
}

pub struct PollingController {
    source: Arc<dyn PollSource>,
    idle: IdleMonitor,
    config: PollingConfig,
    view: Option<LocalView>,
    repoller: Repoller,
}

impl PollingController {
    pub fn new(source: Arc<dyn PollSource>, idle: IdleMonitor, config: PollingConfig) -> Self {
        Self {
            source,
            idle,
            config,
            view: None,
            repoller: Repoller::default(),
        }
    }

    /// Accepted snapshots replace the base of this view.
    pub fn with_view(mut self, view: LocalView) -> Self {
        self.view = Some(view);
        self
    }

    /// Starts polling immediately. `tick_interval_hint` seeds the countdown
    /// until the first snapshot arrives.
    pub fn start(self, tick_interval_hint: Duration) -> PollingHandle {
        let shared = Arc::new(Mutex::new(Shared {
            latest: None,
            next_tick_at: Instant::now() + tick_interval_hint,
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let live = Arc::new(AtomicBool::new(true));
        let repoller = self.repoller.clone();

        let worker = Worker {
            source: self.source,
            idle: self.idle,
            config: self.config,
            view: self.view,
            repoller: self.repoller,
            shared: Arc::clone(&shared),
            events: events_tx,
            live: Arc::clone(&live),
            shutdown: shutdown_rx,
            next_seq: 0,
            latest_tick: None,
            latest_seq: 0,
            last_log_seq: None,
            consecutive_failures: 0,
            degraded: false,
        };
        let task = tokio::spawn(worker.run());

        PollingHandle {
            shared,
            events: events_rx,
            repoller,
            live,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

pub struct PollingHandle {
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedReceiver<ViewEvent>,
    repoller: Repoller,
    live: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollingHandle {
    pub async fn next_event(&mut self) -> Option<ViewEvent> {
        if !self.live.load(Ordering::Acquire) {
            return None;
        }
        self.events.recv().await
    }

    /// Drains events already emitted without waiting.
    pub fn try_next_event(&mut self) -> Option<ViewEvent> {
        self.events.try_recv().ok()
    }

    pub fn latest(&self) -> Option<TickSnapshot> {
        self.shared.lock().latest.clone()
    }

    pub fn latest_tick(&self) -> Option<u64> {
        self.shared.lock().latest.as_ref().map(|snapshot| snapshot.tick)
    }

    /// Local countdown to the next tick; zero once the deadline has passed.
    pub fn countdown(&self) -> Duration {
        self.shared
            .lock()
            .next_tick_at
            .saturating_duration_since(Instant::now())
    }

    pub fn repoller(&self) -> Repoller {
        self.repoller.clone()
    }

    pub fn stop(&mut self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!(target = "sync.polling", "polling stopped");
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

type PollResult = (u64, SyncResult<PollResponse>);

struct Worker {
    source: Arc<dyn PollSource>,
    idle: IdleMonitor,
    config: PollingConfig,
    view: Option<LocalView>,
    repoller: Repoller,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<ViewEvent>,
    live: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
    next_seq: u64,
    latest_tick: Option<u64>,
    latest_seq: u64,
    last_log_seq: Option<u64>,
    consecutive_failures: u32,
    degraded: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut polls: JoinSet<PollResult> = JoinSet::new();
        let cadence = self.config.cadence;
        let mut ticker = tokio::time::interval_at(Instant::now() + cadence, cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let repoller = self.repoller.clone();

        self.dispatch(&mut polls);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(joined) = polls.join_next() => self.settle(joined),
                _ = ticker.tick() => {
                    if self.idle.evaluate() {
                        if !self.suspend(&mut polls).await {
                            break;
                        }
                        self.dispatch(&mut polls);
                        ticker.reset();
                    } else {
                        self.dispatch(&mut polls);
                    }
                }
                _ = repoller.due() => {
                    debug!(target = "sync.polling", "re-poll requested");
                    self.dispatch(&mut polls);
                }
            }
        }

        polls.abort_all();
    }

    /// Waits out an idle suspension. Returns false on shutdown.
    async fn suspend(&mut self, polls: &mut JoinSet<PollResult>) -> bool {
        info!(target = "sync.polling", tick = ?self.latest_tick, "polling suspended");
        self.emit(ViewEvent::Suspended);
        let idle = self.idle.clone();
        let resumed = idle.resumed();
        tokio::pin!(resumed);
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return false,
                Some(joined) = polls.join_next() => self.settle(joined),
                _ = &mut resumed => break,
            }
        }
        info!(target = "sync.polling", "polling resumed");
        self.emit(ViewEvent::Resumed);
        true
    }

    fn dispatch(&mut self, polls: &mut JoinSet<PollResult>) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let request = PollRequest {
            since: self.latest_tick,
        };
        let source = Arc::clone(&self.source);
        let timeout = self.config.request_timeout;
        self.repoller.clear();
        polls.spawn(async move {
            let result = tokio::time::timeout(timeout, source.poll(request))
                .await
                .map_err(SyncError::from)
                .and_then(|inner| inner);
            (seq, result)
        });
    }

    fn settle(&mut self, joined: Result<PollResult, tokio::task::JoinError>) {
        let (seq, result) = match joined {
            Ok(done) => done,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(target = "sync.polling", error = %err, "poll task failed");
                }
                return;
            }
        };
        match result {
            Ok(response) => {
                self.note_success();
                self.accept(seq, response);
            }
            Err(err) => self.note_failure(seq, err),
        }
    }

    fn accept(&mut self, seq: u64, response: PollResponse) {
        let PollResponse { snapshot, log } = response;
        let tick = snapshot.tick;
        match self.latest_tick {
            Some(latest) if tick < latest || (tick == latest && seq < self.latest_seq) => {
                let stale = SyncError::Stale(format!(
                    "tick {tick} from poll {seq}, latest tick {latest} from poll {}",
                    self.latest_seq
                ));
                debug!(
                    target = "sync.polling",
                    kind = ?stale.kind(),
                    error = %stale,
                    "discarding poll response"
                );
                return;
            }
            Some(latest) if tick == latest => {
                self.latest_seq = seq;
                self.shared.lock().next_tick_at = Instant::now() + snapshot.next_tick_in();
                self.emit_log(log);
                return;
            }
            _ => {}
        }

        let previous = self.latest_tick.replace(tick);
        self.latest_seq = seq;
        {
            let mut shared = self.shared.lock();
            shared.next_tick_at = Instant::now() + snapshot.next_tick_in();
            shared.latest = Some(snapshot.clone());
        }
        if let Some(view) = &self.view {
            match serde_json::to_value(&snapshot) {
                Ok(base) => view.replace(base),
                Err(err) => warn!(
                    target = "sync.polling",
                    error = %err,
                    "snapshot not representable"
                ),
            }
        }

        if let Some(previous) = previous {
            debug!(target = "sync.polling", previous, current = tick, "tick boundary");
            self.emit(ViewEvent::TickBoundary {
                previous,
                current: tick,
            });
        }
        self.emit(ViewEvent::Snapshot(snapshot));
        self.emit_log(log);
    }

    fn emit_log(&mut self, mut log: Vec<LogEntry>) {
        log.sort_by_key(|entry| entry.seq);
        for entry in log {
            if self.last_log_seq.is_some_and(|last| entry.seq <= last) {
                continue;
            }
            self.last_log_seq = Some(entry.seq);
            self.emit(ViewEvent::Log(entry));
        }
    }

    fn note_success(&mut self) {
        self.consecutive_failures = 0;
        if self.degraded {
            self.degraded = false;
            info!(target = "sync.polling", "poll connectivity recovered");
            self.emit(ViewEvent::Recovered);
        }
    }

    fn note_failure(&mut self, seq: u64, err: SyncError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            target = "sync.polling",
            seq,
            failures = self.consecutive_failures,
            error = %err,
            "poll failed"
        );
        if !self.degraded && self.consecutive_failures >= self.config.degraded_after.max(1) {
            self.degraded = true;
            self.emit(ViewEvent::Degraded {
                consecutive_failures: self.consecutive_failures,
            });
        }
    }

    fn emit(&self, event: ViewEvent) {
        if self.live.load(Ordering::Acquire) {
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    fn snapshot(tick: u64) -> TickSnapshot {
        TickSnapshot {
            tick,
            tick_interval_ms: 10_000,
            phase: "combat".into(),
            scores: Value::Null,
            resources: Value::Null,
            map: Value::Null,
            next_tick_in_ms: None,
        }
    }

    fn config() -> PollingConfig {
        PollingConfig {
            cadence: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            degraded_after: 2,
            idle_threshold: Duration::from_secs(300),
        }
    }

    /// Serves scripted responses in order, then repeats the last one.
    struct Script {
        responses: Mutex<VecDeque<SyncResult<PollResponse>>>,
        last: Mutex<Option<SyncResult<PollResponse>>>,
        calls: AtomicU32,
    }

    impl Script {
        fn new(responses: Vec<SyncResult<PollResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                last: Mutex::new(None),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PollSource for Script {
        async fn poll(&self, _request: PollRequest) -> SyncResult<PollResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().pop_front();
            match next {
                Some(response) => {
                    *self.last.lock() = Some(response.clone());
                    response
                }
                None => self
                    .last
                    .lock()
                    .clone()
                    .unwrap_or(Err(SyncError::Transport("no script".into()))),
            }
        }
    }

    fn ok(tick: u64) -> SyncResult<PollResponse> {
        Ok(PollResponse {
            snapshot: snapshot(tick),
            log: Vec::new(),
        })
    }

    fn controller(source: Arc<dyn PollSource>) -> PollingController {
        PollingController::new(source, IdleMonitor::new(Duration::from_secs(300)), config())
    }

    fn timed(tick: u64, next_tick_in_ms: u64) -> PollResponse {
        let mut snapshot = snapshot(tick);
        snapshot.next_tick_in_ms = Some(next_tick_in_ms);
        PollResponse {
            snapshot,
            log: Vec::new(),
        }
    }

    fn drain(handle: &mut PollingHandle) -> Vec<ViewEvent> {
        std::iter::from_fn(|| handle.try_next_event()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn boundary_emitted_once_per_tick_change() {
        let source = Script::new(vec![ok(1), ok(1), ok(2), ok(2), ok(2)]);
        let controller = controller(source.clone());
        let mut handle = controller.start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        let events = drain(&mut handle);
        let boundaries: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, ViewEvent::TickBoundary { .. }))
            .collect();
        assert_eq!(
            boundaries,
            vec![&ViewEvent::TickBoundary {
                previous: 1,
                current: 2
            }]
        );
        let snapshots = events
            .iter()
            .filter(|event| matches!(event, ViewEvent::Snapshot(_)))
            .count();
        assert_eq!(snapshots, 2);
        assert_eq!(handle.latest_tick(), Some(2));
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_tick_from_newer_poll_only_refreshes_countdown() {
        let source = Script::new(vec![Ok(timed(3, 4_000)), Ok(timed(3, 9_000))]);
        let mut handle = controller(source).start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let remaining = handle.countdown();
        assert!(remaining > Duration::from_secs(8), "{remaining:?}");
        assert!(remaining <= Duration::from_secs(9));

        let events = drain(&mut handle);
        let snapshots = events
            .iter()
            .filter(|event| matches!(event, ViewEvent::Snapshot(_)))
            .count();
        assert_eq!(snapshots, 1);
        assert!(!events
            .iter()
            .any(|event| matches!(event, ViewEvent::TickBoundary { .. })));
        assert_eq!(handle.latest_tick(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn late_equal_tick_from_older_poll_is_discarded() {
        let calls = Arc::new(AtomicU32::new(0));
        let source = {
            let calls = Arc::clone(&calls);
            poll_fn(move |_request: PollRequest| {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    match call {
                        1 => Ok(timed(1, 10_000)),
                        // Overtaken by the next two polls; lands at 3.5s.
                        2 => {
                            tokio::time::sleep(Duration::from_millis(2500)).await;
                            Ok(timed(2, 1_000))
                        }
                        3 => Ok(timed(2, 8_000)),
                        _ => Ok(timed(2, 6_000)),
                    }
                }
            })
        };
        let mut handle = controller(Arc::new(source)).start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(3700)).await;
        assert!(calls.load(Ordering::SeqCst) >= 4);
        let remaining = handle.countdown();
        assert!(remaining > Duration::from_secs(5), "{remaining:?}");

        let events = drain(&mut handle);
        let boundaries: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, ViewEvent::TickBoundary { .. }))
            .collect();
        assert_eq!(
            boundaries,
            vec![&ViewEvent::TickBoundary {
                previous: 1,
                current: 2
            }]
        );
        let snapshots = events
            .iter()
            .filter(|event| matches!(event, ViewEvent::Snapshot(_)))
            .count();
        assert_eq!(snapshots, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_follows_server_timing() {
        let mut response = snapshot(3);
        response.next_tick_in_ms = Some(4_000);
        let source = Script::new(vec![Ok(PollResponse {
            snapshot: response,
            log: Vec::new(),
        })]);
        let controller = controller(source);
        let handle = controller.start(Duration::from_secs(60));
        assert_eq!(handle.countdown(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let remaining = handle.countdown();
        assert!(remaining <= Duration::from_secs(4));
        assert!(remaining > Duration::from_millis(3_900));
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_after_consecutive_failures_then_recovered() {
        let fail = || Err(SyncError::Status {
            status: 503,
            body: String::new(),
        });
        let source = Script::new(vec![ok(1), fail(), fail(), fail(), ok(2)]);
        let controller = controller(source);
        let mut handle = controller.start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        let events = drain(&mut handle);
        let degraded = events
            .iter()
            .filter(|event| matches!(event, ViewEvent::Degraded { .. }))
            .count();
        assert_eq!(degraded, 1);
        assert!(events.contains(&ViewEvent::Degraded {
            consecutive_failures: 2
        }));
        assert!(events.contains(&ViewEvent::Recovered));
        assert_eq!(handle.latest_tick(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn log_entries_are_deduplicated() {
        let entry = |seq| LogEntry {
            seq,
            tick: 1,
            message: format!("volley {seq}"),
        };
        let source = Script::new(vec![
            Ok(PollResponse {
                snapshot: snapshot(1),
                log: vec![entry(2), entry(1)],
            }),
            Ok(PollResponse {
                snapshot: snapshot(1),
                log: vec![entry(2), entry(3)],
            }),
        ]);
        let controller = controller(source);
        let mut handle = controller.start(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let seqs: Vec<u64> = drain(&mut handle)
            .into_iter()
            .filter_map(|event| match event {
                ViewEvent::Log(entry) => Some(entry.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn repoll_within_fires_before_cadence() {
        let source = Script::new(vec![ok(1)]);
        let mut config = config();
        config.cadence = Duration::from_secs(30);
        let controller = PollingController::new(
            source.clone(),
            IdleMonitor::new(Duration::from_secs(300)),
            config,
        );
        let handle = controller.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        let repoller = handle.repoller();
        repoller.repoll_within(Duration::from_secs(5));
        repoller.repoll_within(Duration::from_millis(300));
        repoller.repoll_within(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(repoller.pending().is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_polling() {
        let source = Script::new(vec![ok(1)]);
        let controller = PollingController::new(
            source.clone(),
            IdleMonitor::new(Duration::from_secs(300)),
            config(),
        );
        let mut handle = controller.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop();
        let calls = source.calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
        assert!(handle.next_event().await.is_none());
    }
}
