//! Sent-message ledger persistence.
//!
//! The ledger survives restarts so a message confirmed sent is never sent
//! again. It is loaded once at startup and rewritten after every delivery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, info};
use wd_common::MessageId;

use crate::error::LedgerError;
use crate::state::DispatchState;

/// Storage backend for the ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load every recorded id. A store that does not exist yet yields an
    /// empty set and is initialized.
    async fn load(&self) -> Result<BTreeSet<MessageId>, LedgerError>;

    /// Replace the stored set with `ids`.
    async fn save(&self, ids: &[MessageId]) -> Result<(), LedgerError>;
}

/// Ledger kept as a pretty-printed JSON array of ids
pub struct JsonFileLedgerStore {
    path: PathBuf,
}

impl JsonFileLedgerStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl LedgerStore for JsonFileLedgerStore {
    async fn load(&self) -> Result<BTreeSet<MessageId>, LedgerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let ids: Vec<MessageId> = serde_json::from_str(&content)?;
                Ok(ids.into_iter().collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.save(&[]).await?;
                info!(path = %self.path.display(), "Ledger file created");
                Ok(BTreeSet::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, ids: &[MessageId]) -> Result<(), LedgerError> {
        let content = serde_json::to_string_pretty(ids)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Ledger held only in memory, for tests and dry runs
#[derive(Default)]
pub struct InMemoryLedgerStore {
    ids: SyncMutex<Vec<MessageId>>,
    saves: SyncMutex<usize>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I: IntoIterator<Item = MessageId>>(ids: I) -> Self {
        Self {
            ids: SyncMutex::new(ids.into_iter().collect()),
            saves: SyncMutex::new(0),
        }
    }

    /// The last saved content
    pub fn stored(&self) -> Vec<MessageId> {
        self.ids.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn load(&self) -> Result<BTreeSet<MessageId>, LedgerError> {
        Ok(self.ids.lock().iter().copied().collect())
    }

    async fn save(&self, ids: &[MessageId]) -> Result<(), LedgerError> {
        *self.ids.lock() = ids.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Serializes ledger writes coming from concurrent dispatch loops.
///
/// The snapshot is taken after the write lock is acquired, so the last write
/// to finish always carries the newest set.
pub struct DispatchLedger {
    store: Arc<dyn LedgerStore>,
    write_lock: Mutex<()>,
}

impl DispatchLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Load stored ids into the shared state. Returns how many were loaded.
    pub async fn load_into(&self, state: &DispatchState) -> Result<usize, LedgerError> {
        let ids = self.store.load().await?;
        let count = ids.len();
        state.load_ledger(ids);
        Ok(count)
    }

    /// Write the current ledger set of `state` to the store
    pub async fn persist(&self, state: &DispatchState) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;
        let ids = state.ledger_ids();
        self.store.save(&ids).await?;
        debug!(ledger_size = ids.len(), "Ledger persisted");
        Ok(())
    }
}
