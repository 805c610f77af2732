use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8080";
const DEFAULT_TOKEN_CHANNEL: &str = "live-sync.token";

/// Configuration for the whole synchronization layer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the game API (poll, command and realtime endpoints).
    pub api_base: String,
    pub subscription: SubscriptionConfig,
    pub polling: PollingConfig,
    pub command: CommandConfig,
    pub token: TokenConfig,
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub reconnect: BackoffPolicy,
    pub connect_timeout: Duration,
    /// Events held per handle for a slow reader; the oldest are dropped first.
    pub event_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Poll cadence, independent of the server's tick length.
    pub cadence: Duration,
    pub request_timeout: Duration,
    /// Consecutive failures before the view is told connectivity is degraded.
    pub degraded_after: u32,
    pub idle_threshold: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub max_attempts: u32,
    pub retry: BackoffPolicy,
    pub request_timeout: Duration,
    /// Upper bound on how long after a confirmed command the view re-polls.
    pub repoll_within: Duration,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub freshness: Duration,
    /// After receiving a broadcast rotation, local rotations are suppressed this long.
    pub lock_window: Duration,
    pub durable_path: Option<PathBuf>,
    pub channel: String,
}

impl SyncConfig {
    /// Load configuration from `LIVE_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_base = env::var("LIVE_SYNC_API_BASE")
            .map(|value| normalize_api_base(&value))
            .unwrap_or(defaults.api_base);

        let subscription = SubscriptionConfig {
            reconnect: BackoffPolicy::new(
                env_millis(
                    "LIVE_SYNC_RECONNECT_BASE_MS",
                    defaults.subscription.reconnect.base,
                ),
                env_millis(
                    "LIVE_SYNC_RECONNECT_CAP_MS",
                    defaults.subscription.reconnect.cap,
                ),
            ),
            connect_timeout: env_millis(
                "LIVE_SYNC_CONNECT_TIMEOUT_MS",
                defaults.subscription.connect_timeout,
            ),
            event_buffer: env_parse(
                "LIVE_SYNC_EVENT_BUFFER",
                defaults.subscription.event_buffer,
            )
            .max(1),
        };

        let polling = PollingConfig {
            cadence: env_millis("LIVE_SYNC_POLL_CADENCE_MS", defaults.polling.cadence),
            request_timeout: env_millis(
                "LIVE_SYNC_POLL_TIMEOUT_MS",
                defaults.polling.request_timeout,
            ),
            degraded_after: env_parse("LIVE_SYNC_DEGRADED_AFTER", defaults.polling.degraded_after),
            idle_threshold: env_secs(
                "LIVE_SYNC_IDLE_THRESHOLD_SECS",
                defaults.polling.idle_threshold,
            ),
        };

        let command = CommandConfig {
            max_attempts: env_parse("LIVE_SYNC_COMMAND_ATTEMPTS", defaults.command.max_attempts)
                .max(1),
            retry: BackoffPolicy::new(
                env_millis(
                    "LIVE_SYNC_COMMAND_BACKOFF_BASE_MS",
                    defaults.command.retry.base,
                ),
                env_millis(
                    "LIVE_SYNC_COMMAND_BACKOFF_CAP_MS",
                    defaults.command.retry.cap,
                ),
            ),
            request_timeout: env_millis(
                "LIVE_SYNC_COMMAND_TIMEOUT_MS",
                defaults.command.request_timeout,
            ),
            repoll_within: env_millis("LIVE_SYNC_REPOLL_WITHIN_MS", defaults.command.repoll_within),
        };

        let token = TokenConfig {
            freshness: env_secs("LIVE_SYNC_TOKEN_FRESHNESS_SECS", defaults.token.freshness),
            lock_window: env_millis("LIVE_SYNC_TOKEN_LOCK_MS", defaults.token.lock_window),
            durable_path: env::var("LIVE_SYNC_TOKEN_FILE")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            channel: env::var("LIVE_SYNC_TOKEN_CHANNEL").unwrap_or(defaults.token.channel),
        };

        Self {
            api_base,
            subscription,
            polling,
            command,
            token,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            subscription: SubscriptionConfig {
                reconnect: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
                connect_timeout: Duration::from_secs(10),
                event_buffer: 256,
            },
            polling: PollingConfig {
                cadence: Duration::from_secs(1),
                request_timeout: Duration::from_secs(5),
                degraded_after: 3,
                idle_threshold: Duration::from_secs(300),
            },
            command: CommandConfig {
                max_attempts: 3,
                retry: BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(2)),
                request_timeout: Duration::from_secs(8),
                repoll_within: Duration::from_millis(300),
            },
            token: TokenConfig {
                freshness: Duration::from_secs(30 * 60),
                lock_window: Duration::from_secs(2),
                durable_path: None,
                channel: DEFAULT_TOKEN_CHANNEL.to_string(),
            },
        }
    }
}

fn normalize_api_base(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
    if let Some(rest) = trimmed.strip_prefix("http://localhost") {
        format!("http://127.0.0.1{rest}")
    } else {
        trimmed.to_string()
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
