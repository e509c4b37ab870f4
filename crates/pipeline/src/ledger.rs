//! Access to the work queue records.
//!
//! `FileLedger` keeps one JSON document per item in a directory and is what the
//! daemon runs against. `MemoryLedger` keeps everything in process and records
//! every status write, which the tests use to check transition sequences.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::item::WorkItem;
use crate::status::WorkStatus;

/// Lock files older than this are assumed to belong to a crashed writer
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    fn storage(err: anyhow::Error) -> Self {
        LedgerError::Storage(format!("{:#}", err))
    }
}

/// A single status write. Applied as one update of the item record.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: WorkStatus,
    pub updated_at: DateTime<Utc>,
    /// Replaces the stored error message; `None` clears it
    pub error_message: Option<String>,
    /// Replaces the stored retry count when set
    pub retry_count: Option<u32>,
}

impl StatusUpdate {
    pub fn new(status: WorkStatus, updated_at: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at,
            error_message: None,
            retry_count: None,
        }
    }

    pub fn failed(updated_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: WorkStatus::Failed,
            updated_at,
            error_message: Some(message.into()),
            retry_count: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    fn apply(&self, item: &mut WorkItem) {
        item.status = self.status;
        item.updated_at = self.updated_at;
        item.error_message = self.error_message.clone();
        if let Some(count) = self.retry_count {
            item.retry_count = count;
        }
    }
}

#[async_trait]
pub trait StatusLedger: Send + Sync {
    /// Items in `pending`, optionally restricted to one owner
    async fn list_pending(&self, owner: Option<&str>) -> Result<Vec<WorkItem>, LedgerError>;

    /// In-flight items whose last write is older than `updated_before`
    async fn list_stalled(&self, updated_before: DateTime<Utc>) -> Result<Vec<WorkItem>, LedgerError>;

    /// Unconditional single-row status write
    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), LedgerError>;

    /// Writes `update` only if the stored status is still `expected`.
    /// Returns whether the write happened.
    async fn compare_and_set(
        &self,
        id: &str,
        expected: WorkStatus,
        update: StatusUpdate,
    ) -> Result<bool, LedgerError>;
}

/// One recorded status write
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub id: String,
    pub status: WorkStatus,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    items: BTreeMap<String, WorkItem>,
    history: Vec<LedgerEvent>,
}

/// In-process ledger
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let ledger = Self::new();
        for item in items {
            ledger.insert(item);
        }
        ledger
    }

    /// Add or replace an item, recording its current status
    pub fn insert(&self, item: WorkItem) {
        let mut state = self.state.lock();
        state.history.push(LedgerEvent {
            id: item.id.clone(),
            status: item.status,
            updated_at: item.updated_at,
            error_message: item.error_message.clone(),
        });
        state.items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.state.lock().items.get(id).cloned()
    }

    /// Drop an item, as if its row was deleted out from under the pipeline
    pub fn remove(&self, id: &str) -> Option<WorkItem> {
        self.state.lock().items.remove(id)
    }

    /// Every status recorded for `id`, oldest first, including the initial one
    pub fn history(&self, id: &str) -> Vec<LedgerEvent> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|event| event.id == id)
            .cloned()
            .collect()
    }

    pub fn statuses(&self, id: &str) -> Vec<WorkStatus> {
        self.history(id).into_iter().map(|event| event.status).collect()
    }

    fn write(state: &mut MemoryState, id: &str, update: &StatusUpdate) -> Result<(), LedgerError> {
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        update.apply(item);
        state.history.push(LedgerEvent {
            id: id.to_string(),
            status: update.status,
            updated_at: update.updated_at,
            error_message: update.error_message.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl StatusLedger for MemoryLedger {
    async fn list_pending(&self, owner: Option<&str>) -> Result<Vec<WorkItem>, LedgerError> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.status == WorkStatus::Pending)
            .filter(|item| owner.map_or(true, |o| item.owner_id == o))
            .cloned()
            .collect())
    }

    async fn list_stalled(&self, updated_before: DateTime<Utc>) -> Result<Vec<WorkItem>, LedgerError> {
        Ok(self
            .state
            .lock()
            .items
            .values()
            .filter(|item| item.status.is_in_flight() && item.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), LedgerError> {
        Self::write(&mut self.state.lock(), id, &update)
    }

    async fn compare_and_set(
        &self,
        id: &str,
        expected: WorkStatus,
        update: StatusUpdate,
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.lock();
        let current = state
            .items
            .get(id)
            .map(|item| item.status)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if current != expected {
            return Ok(false);
        }
        Self::write(&mut state, id, &update)?;
        Ok(true)
    }
}

/// Directory of `<id>.json` documents
#[derive(Debug, Clone)]
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    /// Open (and create if needed) a ledger directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create ledger directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            anyhow::bail!("Invalid work item id: {:?}", id);
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// Load every item in the directory. Unreadable documents are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read ledger directory: {}", self.dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read item file: {}", path.display()))
                .and_then(|content| {
                    serde_json::from_str::<WorkItem>(&content)
                        .with_context(|| format!("Failed to parse item file: {}", path.display()))
                });
            match parsed {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping unreadable item: {:#}", e),
            }
        }

        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(items)
    }

    pub fn load(&self, id: &str) -> Result<Option<WorkItem>> {
        let path = self.item_path(id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read item file: {}", path.display())),
        };
        let item = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse item file: {}", path.display()))?;
        Ok(Some(item))
    }

    /// Write an item, replacing the previous document atomically
    pub fn save(&self, item: &WorkItem) -> Result<()> {
        let path = self.item_path(&item.id)?;
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(item).context("Failed to serialize work item")?;
        fs::write(&tmp, content).with_context(|| format!("Failed to write item file: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move {} into place", tmp.display()))?;
        Ok(())
    }

    /// Read-modify-write of one item under its lock file
    fn modify<F>(&self, id: &str, f: F) -> Result<Result<bool, LedgerError>>
    where
        F: FnOnce(&mut WorkItem) -> bool,
    {
        let _lock = LockFile::acquire(&self.item_path(id)?.with_extension("lock"))?;
        let mut item = match self.load(id)? {
            Some(item) => item,
            None => return Ok(Err(LedgerError::NotFound(id.to_string()))),
        };
        if !f(&mut item) {
            return Ok(Ok(false));
        }
        self.save(&item)?;
        Ok(Ok(true))
    }
}

impl FileLedger {
    /// Run blocking file work on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&FileLedger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| LedgerError::Storage(format!("ledger task failed: {}", e)))?
    }
}

#[async_trait]
impl StatusLedger for FileLedger {
    async fn list_pending(&self, owner: Option<&str>) -> Result<Vec<WorkItem>, LedgerError> {
        let owner = owner.map(str::to_string);
        self.blocking(move |ledger| {
            let items = ledger.load_all().map_err(LedgerError::storage)?;
            Ok(items
                .into_iter()
                .filter(|item| item.status == WorkStatus::Pending)
                .filter(|item| owner.as_deref().map_or(true, |o| item.owner_id == o))
                .collect())
        })
        .await
    }

    async fn list_stalled(&self, updated_before: DateTime<Utc>) -> Result<Vec<WorkItem>, LedgerError> {
        self.blocking(move |ledger| {
            let items = ledger.load_all().map_err(LedgerError::storage)?;
            Ok(items
                .into_iter()
                .filter(|item| item.status.is_in_flight() && item.updated_at < updated_before)
                .collect())
        })
        .await
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), LedgerError> {
        let id = id.to_string();
        self.blocking(move |ledger| {
            ledger
                .modify(&id, |item| {
                    update.apply(item);
                    true
                })
                .map_err(LedgerError::storage)?
                .map(|_| ())
        })
        .await
    }

    async fn compare_and_set(
        &self,
        id: &str,
        expected: WorkStatus,
        update: StatusUpdate,
    ) -> Result<bool, LedgerError> {
        let id = id.to_string();
        self.blocking(move |ledger| {
            ledger
                .modify(&id, |item| {
                    if item.status != expected {
                        debug!("Item {}: expected {} but found {}", item.id, expected, item.status);
                        return false;
                    }
                    update.apply(item);
                    true
                })
                .map_err(LedgerError::storage)?
        })
        .await
    }
}

/// Exclusive lock file, removed on drop. Acquiring blocks the calling
/// thread, so async callers go through the blocking pool.
pub(crate) struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..50 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => return Ok(Self { path: path.to_path_buf() }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let age = fs::metadata(path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                    if age.map_or(false, |age| age > STALE_LOCK_AGE) {
                        warn!("Removing stale lock file: {}", path.display());
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create lock file: {}", path.display()))
                }
            }
        }
        anyhow::bail!("Timed out waiting for lock: {}", path.display())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}
