use std::path::PathBuf;

use clap::Parser;
use live_sync::Action;
use serde_json::Value;

use crate::telemetry::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "battle-watch", about = "Follow a live battle from the terminal")]
pub struct Cli {
    /// Battle to follow.
    #[arg(long, env = "LIVE_SYNC_BATTLE_ID")]
    pub battle: String,

    /// Overrides LIVE_SYNC_API_BASE.
    #[arg(long)]
    pub api_base: Option<String>,

    /// Realtime table to subscribe to, filtered on `battle_id`.
    #[arg(long, default_value = "battle_units")]
    pub topic: String,

    /// Submit one command once the view is up: `kind[:target]=json`.
    #[arg(long, value_parser = parse_order)]
    pub order: Option<Order>,

    /// Tick length assumed until the first snapshot arrives.
    #[arg(long, default_value_t = 10_000)]
    pub tick_hint_ms: u64,

    /// Stop after this many tick boundaries.
    #[arg(long)]
    pub exit_after_ticks: Option<u64>,

    #[arg(long, env = "LIVE_SYNC_TAB_ID")]
    pub tab_id: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "LIVE_SYNC_LOG_LEVEL")]
    pub log_level: LogLevel,

    #[arg(long, env = "LIVE_SYNC_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub kind: String,
    pub target: Option<String>,
    pub payload: Value,
}

impl Order {
    pub fn action(&self) -> Action {
        let action = Action::new(self.kind.clone());
        match &self.target {
            Some(target) => action.on(target),
            None => action,
        }
    }
}

pub fn parse_order(raw: &str) -> Result<Order, String> {
    let (head, payload) = raw.split_once('=').unwrap_or((raw, ""));
    let (kind, target) = match head.split_once(':') {
        Some((kind, target)) => (kind.trim(), Some(target.trim().to_string())),
        None => (head.trim(), None),
    };
    if kind.is_empty() {
        return Err("order needs an action kind".to_string());
    }
    let payload = if payload.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(payload).map_err(|err| format!("order payload is not JSON: {err}"))?
    };
    Ok(Order {
        kind: kind.to_string(),
        target: target.filter(|target| !target.is_empty()),
        payload,
    })
}
