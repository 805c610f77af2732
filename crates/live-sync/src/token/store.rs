//! Storage tiers for the shared token.
//!
//! Only the synchronizer writes here; everything else goes through
//! `TokenSynchronizer::rotate`.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use super::SharedToken;

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("token store decode: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, TokenStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Per-instance, gone with the instance.
    Session,
    /// Visible to every instance of the origin.
    Shared,
    /// Survives restarts.
    Durable,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn load(&self) -> StoreResult<Option<SharedToken>>;

    async fn save(&self, token: &SharedToken) -> StoreResult<()>;

    async fn clear(&self) -> StoreResult<()>;
}

/// In-memory slot. Clones share the slot, so handing a clone of one
/// `Shared` store to several synchronizers models origin-wide storage.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tier: Tier,
    slot: Arc<Mutex<Option<SharedToken>>>,
}

impl MemoryStore {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session() -> Self {
        Self::new(Tier::Session)
    }

    pub fn shared() -> Self {
        Self::new(Tier::Shared)
    }

    pub fn peek(&self) -> Option<SharedToken> {
        self.slot.lock().clone()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn load(&self) -> StoreResult<Option<SharedToken>> {
        Ok(self.slot.lock().clone())
    }

    async fn save(&self, token: &SharedToken) -> StoreResult<()> {
        *self.slot.lock() = Some(token.clone());
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Durable tier: one JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileStore {
    fn tier(&self) -> Tier {
        Tier::Durable
    }

    async fn load(&self) -> StoreResult<Option<SharedToken>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, token: &SharedToken) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(token)?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
