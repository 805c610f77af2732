use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Crates whose verbosity follows `--log-level`; everything else stays at
/// `info` unless `LIVE_SYNC_LOG_DEPS` is set.
const SYNC_CRATES: &[&str] = &["live_sync", "tab_bus", "battle_watch"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid LIVE_SYNC_LOG_FILTER {filter:?}: {reason}")]
    Filter { filter: String, reason: String },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Logs go to stderr unless a file is given,
/// so they never interleave with the battle feed on stdout.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = resolve_directives(
        config.level,
        std::env::var("LIVE_SYNC_LOG_FILTER").ok(),
        env_flag("LIVE_SYNC_LOG_DEPS"),
    );
    let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
        filter: directives.clone(),
        reason: err.to_string(),
    })?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(target = "watch", directives = %directives, "logging ready");
    Ok(())
}

fn env_flag(var: &str) -> bool {
    std::env::var(var).is_ok_and(|value| !value.is_empty() && value != "0")
}

/// An explicit override wins verbatim. Otherwise quiet levels apply
/// everywhere and verbose levels apply to the sync crates only.
fn resolve_directives(level: LogLevel, custom: Option<String>, include_deps: bool) -> String {
    if let Some(custom) = custom.filter(|custom| !custom.trim().is_empty()) {
        return custom;
    }
    if level <= LogLevel::Info {
        return level.as_str().to_string();
    }
    let global = if include_deps { level.as_str() } else { "info" };
    std::iter::once(global.to_string())
        .chain(
            SYNC_CRATES
                .iter()
                .map(|krate| format!("{krate}={}", level.as_str())),
        )
        .collect::<Vec<_>>()
        .join(",")
}
