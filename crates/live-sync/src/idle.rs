use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Passive activity signals fed in by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Pointer,
    Key,
    Scroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleState {
    pub last_activity: Instant,
    pub suspended: bool,
}

/// One idle detector shared by every polling controller of an instance.
///
/// Suspension is sticky: the monitor never resumes on its own, only on new
/// activity or an explicit [`IdleMonitor::resume`].
#[derive(Clone)]
pub struct IdleMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    threshold: Duration,
    state: watch::Sender<IdleState>,
}

impl IdleMonitor {
    pub fn new(threshold: Duration) -> Self {
        let (state, _) = watch::channel(IdleState {
            last_activity: Instant::now(),
            suspended: false,
        });
        Self {
            inner: Arc::new(Inner { threshold, state }),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.inner.threshold
    }

    pub fn state(&self) -> IdleState {
        *self.inner.state.borrow()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.borrow().suspended
    }

    pub fn subscribe(&self) -> watch::Receiver<IdleState> {
        self.inner.state.subscribe()
    }

    pub fn record_activity(&self, kind: ActivityKind) {
        let now = Instant::now();
        let resumed = self.inner.state.send_if_modified(|state| {
            state.last_activity = now;
            if state.suspended {
                state.suspended = false;
                true
            } else {
                false
            }
        });
        if resumed {
            info!(target = "sync.idle", ?kind, "activity resumed polling");
        }
    }

    /// Manual resume, e.g. a "resume live updates" control.
    pub fn resume(&self) {
        self.record_activity_quietly();
        info!(target = "sync.idle", "manual resume");
    }

    /// Suspends once the threshold has elapsed since the last activity.
    /// Returns whether the monitor is suspended.
    pub fn evaluate(&self) -> bool {
        let threshold = self.inner.threshold;
        let now = Instant::now();
        let mut idle_for = Duration::ZERO;
        let suspended_now = self.inner.state.send_if_modified(|state| {
            if state.suspended {
                return false;
            }
            idle_for = now.saturating_duration_since(state.last_activity);
            if idle_for >= threshold {
                state.suspended = true;
                true
            } else {
                false
            }
        });
        if suspended_now {
            info!(
                target = "sync.idle",
                idle_secs = idle_for.as_secs(),
                "idle threshold reached, suspending polling"
            );
        }
        self.is_suspended()
    }

    /// Resolves once the monitor is no longer suspended.
    pub async fn resumed(&self) {
        let mut rx = self.subscribe();
        if rx.wait_for(|state| !state.suspended).await.is_err() {
            debug!(target = "sync.idle", "idle monitor dropped while waiting");
        }
    }

    fn record_activity_quietly(&self) {
        let now = Instant::now();
        self.inner.state.send_if_modified(|state| {
            state.last_activity = now;
            std::mem::replace(&mut state.suspended, false)
        });
    }
}
