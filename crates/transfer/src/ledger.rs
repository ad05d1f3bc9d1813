//! Durable resume markers.
//!
//! A marker records that a transfer of a file is in progress. It is written
//! before the first byte moves and removed only on success or explicit
//! cancel, so after a crash or ordinary failure it is still there for the
//! next session to discover.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;
use crate::remote::BoxFuture;
use crate::retry::RetryPolicy;
use crate::types::TransferDirection;

/// Local durable key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>, TransferError>>;

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<(), TransferError>>;

    /// Removes a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), TransferError>>;

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, TransferError>>;
}

/// Key-value store persisted to a JSON file.
///
/// Entries are cached in memory and the whole map is rewritten on every
/// change.
pub struct JsonFileStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<BTreeMap<String, serde_json::Value>>,
}

impl JsonFileStore {
    /// Opens a store, loading existing entries from disk.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let entries = load_entries(&path).await?;
        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current entries to disk.
    ///
    /// The map goes to a temporary file next to the store first and is then
    /// renamed over it, so the store file is always a complete document.
    async fn persist(&self, entries: &BTreeMap<String, serde_json::Value>) -> Result<(), TransferError> {
        let json = serde_json::to_string_pretty(entries)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        tokio::fs::create_dir_all(parent).await.map_err(store_io)?;

        let tmp_path = parent.join(format!(".resume.{}.tmp", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(store_io)?;
        file.write_all(json.as_bytes()).await.map_err(store_io)?;
        file.sync_all().await.map_err(store_io)?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(store_io(e));
        }
        debug!("persisted {} resume entries to {:?}", entries.len(), self.path);
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>, TransferError>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.entries.lock().await.get(&key).cloned()) })
    }

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<(), TransferError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            entries.insert(key, value);
            self.persist(&entries).await
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), TransferError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if entries.remove(&key).is_some() {
                self.persist(&entries).await?;
            }
            Ok(())
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, TransferError>> {
        Box::pin(async move { Ok(self.entries.lock().await.keys().cloned().collect()) })
    }
}

async fn load_entries(path: &Path) -> Result<BTreeMap<String, serde_json::Value>, TransferError> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(store_io(e)),
    };
    let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(&data)?;
    debug!("loaded {} resume entries from {:?}", entries.len(), path);
    Ok(entries)
}

fn store_io(e: std::io::Error) -> TransferError {
    TransferError::Store(format!("I/O error: {e}"))
}

/// In-memory [`KeyValueStore`], lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, serde_json::Value>>, TransferError> {
        self.entries
            .lock()
            .map_err(|_| TransferError::Store("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>, TransferError>> {
        let result = self.lock().map(|m| m.get(key).cloned());
        Box::pin(async move { result })
    }

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<(), TransferError>> {
        let result = self.lock().map(|mut m| {
            m.insert(key.to_string(), value);
        });
        Box::pin(async move { result })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), TransferError>> {
        let result = self.lock().map(|mut m| {
            m.remove(key);
        });
        Box::pin(async move { result })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, TransferError>> {
        let result = self.lock().map(|m| m.keys().cloned().collect());
        Box::pin(async move { result })
    }
}

/// Persisted record of a transfer in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMarker {
    pub file_id: String,
    pub local_path: PathBuf,
}

impl TransferDirection {
    /// Key prefix of this direction's resume markers.
    pub fn marker_prefix(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "UPLOAD:",
            TransferDirection::Download => "DOWNLOAD:",
        }
    }
}

/// Resume markers on top of a [`KeyValueStore`].
///
/// Every store access goes through the retry policy.
#[derive(Clone)]
pub struct ResumeLedger {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl ResumeLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Store key of a file's marker.
    pub fn key(direction: TransferDirection, file_id: &str) -> String {
        format!("{}{file_id}", direction.marker_prefix())
    }

    /// Records that a transfer of `marker.file_id` is in progress.
    pub async fn save(
        &self,
        direction: TransferDirection,
        marker: &ResumeMarker,
    ) -> Result<(), TransferError> {
        let key = Self::key(direction, &marker.file_id);
        let value = serde_json::to_value(marker)?;
        // Marker bookkeeping has to complete even while the owning transfer
        // is being cancelled.
        let never = CancellationToken::new();
        self.retry
            .run("save resume marker", &never, || self.store.set(&key, value.clone()))
            .await
    }

    pub async fn load(
        &self,
        direction: TransferDirection,
        file_id: &str,
    ) -> Result<Option<ResumeMarker>, TransferError> {
        let key = Self::key(direction, file_id);
        let never = CancellationToken::new();
        let value = self
            .retry
            .run("load resume marker", &never, || self.store.get(&key))
            .await?;
        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(TransferError::from)
    }

    pub async fn clear(&self, direction: TransferDirection, file_id: &str) -> Result<(), TransferError> {
        let key = Self::key(direction, file_id);
        let never = CancellationToken::new();
        self.retry
            .run("clear resume marker", &never, || self.store.delete(&key))
            .await
    }

    /// Lists the markers of every interrupted transfer in `direction`.
    ///
    /// Entries that no longer parse are skipped.
    pub async fn pending(&self, direction: TransferDirection) -> Result<Vec<ResumeMarker>, TransferError> {
        let never = CancellationToken::new();
        let keys = self
            .retry
            .run("list resume markers", &never, || self.store.keys())
            .await?;
        let mut markers = Vec::new();
        for key in keys {
            let Some(file_id) = key.strip_prefix(direction.marker_prefix()) else {
                continue;
            };
            match self.load(direction, file_id).await {
                Ok(Some(marker)) => markers.push(marker),
                Ok(None) => {}
                Err(TransferError::Store(e)) => {
                    debug!(key = %key, error = %e, "skipping unreadable resume marker");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(markers)
    }
}
