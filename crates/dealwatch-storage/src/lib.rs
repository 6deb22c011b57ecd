//! Deal document storage + HTTP fetch utilities for dealwatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dealwatch_core::{DealPatch, PersistedDeal};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod http;

pub use http::{
    BackoffPolicy, FetchError, FetchedPage, HostAllowList, HttpClientConfig, HttpFetcher,
    RetryDisposition, TokenBucket, TokenBucketConfig,
};

/// Deletes in retention trims are issued in groups of this size.
pub const TRIM_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deal {id} already exists")]
    AlreadyExists { id: String },
    #[error("deal {id} not found")]
    NotFound { id: String },
    #[error("invalid deal id {id:?}")]
    InvalidId { id: String },
    #[error("store i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding deal document {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store call {op} exceeded its {timeout:?} deadline")]
    Timeout { op: &'static str, timeout: Duration },
}

impl StoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

#[derive(Debug)]
pub struct WriteFailure {
    pub id: String,
    pub error: StoreError,
}

/// Per-record result of a best-effort batch write.
#[derive(Debug, Default)]
pub struct BatchWriteOutcome {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    /// Creates rejected because the identity already existed; the caller re-reads and patches.
    pub conflicts: Vec<PersistedDeal>,
    pub failures: Vec<WriteFailure>,
}

/// Keyed document store for persisted deals.
///
/// Every mutation is identity-keyed: either an atomic create-if-absent or a targeted patch.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<PersistedDeal>, StoreError>;

    /// Missing ids are simply absent from the returned map.
    async fn get_by_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PersistedDeal>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] when the identity is present.
    async fn try_create(&self, deal: &PersistedDeal) -> Result<(), StoreError>;

    async fn update(&self, patch: &DealPatch) -> Result<(), StoreError>;

    /// Deletes the oldest-published records beyond `max_count`; returns how many were removed.
    async fn trim_oldest(&self, max_count: usize) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Best-effort: failures are logged and reported per record, never raised.
    async fn batch_write(
        &self,
        creates: Vec<PersistedDeal>,
        updates: Vec<DealPatch>,
    ) -> BatchWriteOutcome {
        let mut outcome = BatchWriteOutcome::default();
        for deal in creates {
            match self.try_create(&deal).await {
                Ok(()) => outcome.created.push(deal.id),
                Err(StoreError::AlreadyExists { id }) => {
                    debug!(id = id.as_str(), "create raced with an existing record");
                    outcome.conflicts.push(deal);
                }
                Err(error) => {
                    warn!(id = deal.id.as_str(), error = %error, "deal create failed");
                    outcome.failures.push(WriteFailure { id: deal.id, error });
                }
            }
        }
        for patch in updates {
            match self.update(&patch).await {
                Ok(()) => outcome.updated.push(patch.id),
                Err(error) => {
                    warn!(id = patch.id.as_str(), error = %error, "deal update failed");
                    outcome.failures.push(WriteFailure { id: patch.id, error });
                }
            }
        }
        outcome
    }
}

/// Ids the oldest-first trim should delete, given every record's publish time.
fn trim_victims(
    mut entries: Vec<(chrono::DateTime<chrono::Utc>, String)>,
    max_count: usize,
) -> Vec<String> {
    if entries.len() <= max_count {
        return Vec::new();
    }
    entries.sort();
    let excess = entries.len() - max_count;
    entries.into_iter().take(excess).map(|(_, id)| id).collect()
}

/// In-process store. State lives only as long as the value.
#[derive(Debug, Default)]
pub struct MemoryDealStore {
    deals: Mutex<HashMap<String, PersistedDeal>>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<PersistedDeal> {
        let deals = self.deals.lock().await;
        let mut out: Vec<_> = deals.values().cloned().collect();
        out.sort_by(|a, b| a.published_at.cmp(&b.published_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<PersistedDeal>, StoreError> {
        Ok(self.deals.lock().await.get(id).cloned())
    }

    async fn get_by_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PersistedDeal>, StoreError> {
        let deals = self.deals.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| deals.get(id).map(|d| (id.clone(), d.clone())))
            .collect())
    }

    async fn try_create(&self, deal: &PersistedDeal) -> Result<(), StoreError> {
        let mut deals = self.deals.lock().await;
        if deals.contains_key(&deal.id) {
            return Err(StoreError::AlreadyExists { id: deal.id.clone() });
        }
        deals.insert(deal.id.clone(), deal.clone());
        Ok(())
    }

    async fn update(&self, patch: &DealPatch) -> Result<(), StoreError> {
        let mut deals = self.deals.lock().await;
        let deal = deals
            .get_mut(&patch.id)
            .ok_or_else(|| StoreError::NotFound { id: patch.id.clone() })?;
        patch.apply(deal);
        Ok(())
    }

    async fn trim_oldest(&self, max_count: usize) -> Result<usize, StoreError> {
        let mut deals = self.deals.lock().await;
        let entries = deals.values().map(|d| (d.published_at, d.id.clone())).collect();
        let victims = trim_victims(entries, max_count);
        for chunk in victims.chunks(TRIM_BATCH_SIZE) {
            for id in chunk {
                deals.remove(id);
            }
        }
        Ok(victims.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.deals.lock().await.len())
    }
}

/// One JSON document per identity under a root directory.
///
/// Creates write a temp file and hard-link it into place, which fails atomically when the
/// identity already exists. Updates replace the document via temp file + rename.
#[derive(Debug)]
pub struct FileDealStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDealStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId { id: id.to_string() });
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await.map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })
    }

    async fn read_document(&self, path: &Path) -> Result<Option<PersistedDeal>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Writes `deal` to a fresh temp file beside the documents and returns its path.
    async fn write_temp(&self, deal: &PersistedDeal) -> Result<PathBuf, StoreError> {
        let bytes = serde_json::to_vec_pretty(deal).map_err(|source| StoreError::Decode {
            path: self.root.clone(),
            source,
        })?;
        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let io_err = |source| StoreError::Io {
            path: temp_path.clone(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        Ok(temp_path)
    }

    async fn document_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.root.clone(),
            source,
        };
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(err)),
        };
        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_doc = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if is_doc {
                out.push(path);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DealStore for FileDealStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<PersistedDeal>, StoreError> {
        let path = self.document_path(id)?;
        self.read_document(&path).await
    }

    async fn get_by_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PersistedDeal>, StoreError> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(deal) = self.get_by_id(id).await? {
                out.insert(id.clone(), deal);
            }
        }
        Ok(out)
    }

    async fn try_create(&self, deal: &PersistedDeal) -> Result<(), StoreError> {
        let path = self.document_path(&deal.id)?;
        self.ensure_root().await?;
        let temp_path = self.write_temp(deal).await?;

        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists { id: deal.id.clone() })
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn update(&self, patch: &DealPatch) -> Result<(), StoreError> {
        let path = self.document_path(&patch.id)?;
        let _guard = self.write_lock.lock().await;
        let mut deal = self
            .read_document(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: patch.id.clone() })?;
        patch.apply(&mut deal);

        let temp_path = self.write_temp(&deal).await?;
        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io { path, source });
        }
        Ok(())
    }

    async fn trim_oldest(&self, max_count: usize) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = Vec::new();
        for path in self.document_paths().await? {
            match self.read_document(&path).await {
                Ok(Some(deal)) => entries.push((deal.published_at, deal.id)),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "skipping unreadable deal document during trim"),
            }
        }

        let victims = trim_victims(entries, max_count);
        let mut removed = 0usize;
        for chunk in victims.chunks(TRIM_BATCH_SIZE) {
            for id in chunk {
                let path = self.document_path(id)?;
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(StoreError::Io { path, source }),
                }
            }
            debug!(batch = chunk.len(), "retention batch deleted");
        }
        if removed > 0 {
            info!(removed, max_count, "retention trim removed oldest deals");
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.document_paths().await?.len())
    }
}

/// Default deadlines for store calls: reads are short, the retention sweep is long.
#[derive(Debug, Clone, Copy)]
pub struct StoreDeadlines {
    pub read: Duration,
    pub write: Duration,
    pub trim: Duration,
}

impl Default for StoreDeadlines {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(10),
            write: Duration::from_secs(15),
            trim: Duration::from_secs(60),
        }
    }
}

/// Wraps a store so that every call carries a deadline.
#[derive(Debug)]
pub struct DeadlineStore<S> {
    inner: S,
    deadlines: StoreDeadlines,
}

impl<S: DealStore> DeadlineStore<S> {
    pub fn new(inner: S, deadlines: StoreDeadlines) -> Self {
        Self { inner, deadlines }
    }
}

async fn within<T>(
    op: &'static str,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, StoreError>> + Send,
) -> Result<T, StoreError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, timeout }),
    }
}

#[async_trait]
impl<S: DealStore> DealStore for DeadlineStore<S> {
    async fn get_by_id(&self, id: &str) -> Result<Option<PersistedDeal>, StoreError> {
        within("get_by_id", self.deadlines.read, self.inner.get_by_id(id)).await
    }

    async fn get_by_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PersistedDeal>, StoreError> {
        within("get_by_ids", self.deadlines.read, self.inner.get_by_ids(ids)).await
    }

    async fn try_create(&self, deal: &PersistedDeal) -> Result<(), StoreError> {
        within("try_create", self.deadlines.write, self.inner.try_create(deal)).await
    }

    async fn update(&self, patch: &DealPatch) -> Result<(), StoreError> {
        within("update", self.deadlines.write, self.inner.update(patch)).await
    }

    async fn trim_oldest(&self, max_count: usize) -> Result<usize, StoreError> {
        within("trim_oldest", self.deadlines.trim, self.inner.trim_oldest(max_count)).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        within("count", self.deadlines.read, self.inner.count()).await
    }
}
