use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use live_sync::command::CommandOutcome;
use live_sync::http::{HttpCommandEndpoint, HttpPollSource, SsePushTransport};
use live_sync::subscription::RowFilter;
use live_sync::token::store::{FileStore, MemoryStore, TokenStore};
use live_sync::{
    ActivityKind, ChangeEvent, CommandPipeline, ConnectionState, IdleMonitor, LocalView, Outcome,
    PollingController, SubscriptionDescriptor, SubscriptionManager, SyncConfig,
    TokenSynchronizer, ViewEvent,
};
use serde_json::json;
use tab_bus::{LocalBus, TabPort};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::{Cli, Order};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SyncConfig::from_env();
    if let Some(api_base) = &cli.api_base {
        config.api_base = api_base.trim_end_matches('/').to_string();
    }
    info!(
        target = "watch",
        battle = %cli.battle,
        api_base = %config.api_base,
        topic = %cli.topic,
        "starting battle watch"
    );

    let http = reqwest::Client::builder()
        .build()
        .context("building http client")?;
    let idle = IdleMonitor::new(config.polling.idle_threshold);
    let view = LocalView::new(json!({}));

    let source = Arc::new(HttpPollSource::new(
        http.clone(),
        config.api_base.clone(),
        &cli.battle,
        config.polling.request_timeout,
    ));
    let mut polling = PollingController::new(source, idle.clone(), config.polling.clone())
        .with_view(view.clone())
        .start(Duration::from_millis(cli.tick_hint_ms));

    let transport = Arc::new(
        SsePushTransport::new(http.clone(), &config.api_base)
            .context("building realtime transport")?,
    );
    let subscriptions = SubscriptionManager::new(transport, config.subscription.clone());
    let mut units = subscriptions.open(
        SubscriptionDescriptor::new(cli.topic.clone())
            .with_filter(RowFilter::eq("battle_id", &cli.battle)),
    );
    let mut connection = units.watch_state();
    let mut watching_connection = true;

    let tab_id = cli
        .tab_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let port = TabPort::join(Arc::new(LocalBus::new()), tab_id);
    let mut tiers: Vec<Arc<dyn TokenStore>> = vec![
        Arc::new(MemoryStore::session()),
        Arc::new(MemoryStore::shared()),
    ];
    if let Some(path) = &config.token.durable_path {
        tiers.push(Arc::new(FileStore::new(path.clone())));
    }
    let tokens = Arc::new(TokenSynchronizer::new(port, tiers, config.token.clone()));
    tokens.on_rotated(|token| {
        debug!(target = "watch", issued_at_ms = token.issued_at_ms, "token rotated");
    });

    let endpoint = Arc::new(HttpCommandEndpoint::new(
        http,
        config.api_base.clone(),
        config.command.request_timeout,
    ));
    let pipeline = Arc::new(
        CommandPipeline::new(endpoint, tokens.clone(), view.clone(), config.command.clone())
            .with_repoller(polling.repoller()),
    );

    let mut order = cli.order.clone();
    let mut order_task: Option<JoinHandle<CommandOutcome>> = None;
    let mut boundaries = 0u64;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target = "watch", "interrupted");
                break;
            }
            event = polling.next_event() => {
                let Some(event) = event else {
                    warn!(target = "watch", "polling stopped");
                    break;
                };
                if let ViewEvent::Snapshot(_) = &event {
                    if let Some(order) = order.take() {
                        order_task = Some(submit(Arc::clone(&pipeline), order));
                    }
                }
                if let ViewEvent::TickBoundary { .. } = &event {
                    boundaries += 1;
                }
                print_view_event(&event, polling.countdown());
                if cli.exit_after_ticks.is_some_and(|limit| boundaries >= limit) {
                    info!(target = "watch", boundaries, "tick limit reached");
                    break;
                }
            }
            change = units.next_event() => {
                match change {
                    Some(change) => print_change(&change),
                    None => {
                        warn!(target = "watch", "subscription closed");
                        break;
                    }
                }
            }
            changed = connection.changed(), if watching_connection => {
                if changed.is_err() {
                    watching_connection = false;
                    continue;
                }
                let state = *connection.borrow_and_update();
                print_connection(state, units.backoff().attempt);
            }
            outcome = join_order(&mut order_task) => {
                order_task = None;
                print_outcome(outcome);
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(_)) => idle.record_activity(ActivityKind::Key),
                    Ok(None) => stdin_open = false,
                    Err(err) => {
                        debug!(target = "watch", error = %err, "stdin closed");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    if let Some(task) = order_task.take() {
        task.abort();
    }
    polling.stop();
    subscriptions.close(units);
    info!(target = "watch", boundaries, "battle watch stopped");
    Ok(())
}

fn submit(pipeline: Arc<CommandPipeline>, order: Order) -> JoinHandle<CommandOutcome> {
    tokio::spawn(async move {
        let action = order.action();
        info!(target = "watch", action = %action.key(), "submitting order");
        pipeline.submit(&action, order.payload).await
    })
}

async fn join_order(task: &mut Option<JoinHandle<CommandOutcome>>) -> Option<CommandOutcome> {
    match task {
        Some(handle) => handle.await.ok(),
        None => pending().await,
    }
}

fn print_view_event(event: &ViewEvent, countdown: Duration) {
    match event {
        ViewEvent::Snapshot(snapshot) => println!(
            "tick {:>5}  {:<10} next in {:>3}s  scores {}  resources {}",
            snapshot.tick,
            snapshot.phase,
            countdown.as_secs(),
            snapshot.scores,
            snapshot.resources
        ),
        ViewEvent::TickBoundary { previous, current } => {
            println!("---- tick {previous} -> {current} ----")
        }
        ViewEvent::Log(entry) => println!("  [{}] {}", entry.tick, entry.message),
        ViewEvent::Suspended => println!("(idle; polling paused, press enter to resume)"),
        ViewEvent::Resumed => println!("(resumed)"),
        ViewEvent::Degraded {
            consecutive_failures,
        } => println!("(connection degraded after {consecutive_failures} failed polls)"),
        ViewEvent::Recovered => println!("(connection recovered)"),
    }
}

fn print_change(change: &ChangeEvent) {
    println!("  {} {}: {}", change.topic, change.kind.as_str(), change.record);
}

fn print_connection(state: ConnectionState, attempt: u32) {
    match state {
        ConnectionState::Connected => println!("(realtime connected)"),
        ConnectionState::Reconnecting => println!("(realtime reconnecting, attempt {attempt})"),
        ConnectionState::Closed => println!("(realtime closed)"),
        ConnectionState::Idle | ConnectionState::Connecting => {}
    }
}

fn print_outcome(outcome: Option<CommandOutcome>) {
    match outcome {
        Some(Outcome::Ok(receipt)) => println!(
            "order accepted after {} attempt(s){}",
            receipt.attempts,
            receipt
                .detail
                .map(|detail| format!(": {detail}"))
                .unwrap_or_default()
        ),
        Some(Outcome::Failed { kind, detail }) => println!("order failed ({kind:?}): {detail}"),
        Some(Outcome::Retrying { .. }) => {}
        None => warn!(target = "watch", "order task aborted"),
    }
}
