//! Live state synchronization for the battle client.
//!
//! Keeps a local view consistent with the server-authoritative game state
//! over unreliable networks:
//!
//! - [`subscription`]: reconnecting push-channel subscriptions
//! - [`polling`]: tick-bounded polling with idle suspension ([`idle`])
//! - [`command`]: idempotent command submission with optimistic updates on
//!   a shared [`view::LocalView`]
//! - [`token`]: one freshness-bounded credential shared by every instance
//!
//! Transports sit behind traits ([`subscription::PushTransport`],
//! [`polling::PollSource`], [`command::CommandEndpoint`]); [`http`] has the
//! reqwest-backed implementations.

pub mod backoff;
pub mod command;
pub mod config;
pub mod error;
pub mod http;
pub mod idle;
pub mod polling;
pub mod subscription;
pub mod token;
pub mod view;

pub use backoff::{Backoff, BackoffPolicy, BackoffState};
pub use command::{Action, ActionKey, CommandOutcome, CommandPipeline, CommandReceipt};
pub use config::SyncConfig;
pub use error::{ErrorKind, Outcome, SyncError, SyncResult};
pub use idle::{ActivityKind, IdleMonitor};
pub use polling::{PollingController, PollingHandle, Repoller, TickSnapshot, ViewEvent};
pub use subscription::{
    ChangeEvent, ChangeKind, ConnectionState, SubscriptionDescriptor, SubscriptionHandle,
    SubscriptionManager,
};
pub use token::{SharedToken, TokenProvider, TokenState, TokenSynchronizer};
pub use view::{LocalView, Patch};
