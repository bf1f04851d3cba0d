//! Per-user document storage.
//!
//! A document is an opaque JSON blob addressed by
//! `users/{user}/apps/{app}/documents/{name}`. [`FileDocumentStore`] keeps
//! documents under a root directory (a mounted or synced folder acts as the
//! remote). [`CachedDocumentStore`] layers a local read-through/write-through
//! cache on top of any store so reads and writes keep working while the
//! remote is unreachable. Writes still owed to the remote are listed in
//! `pending.json` under the cache directory so they outlive the process.

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::fs;

const PENDING_FILE: &str = "pending.json";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    pub user: String,
    pub app: String,
    pub name: String,
}

impl DocumentId {
    pub fn new(user: impl Into<String>, app: impl Into<String>, name: impl Into<String>) -> Self {
        DocumentId {
            user: user.into(),
            app: app.into(),
            name: name.into(),
        }
    }

    pub fn path(&self) -> String {
        format!(
            "users/{}/apps/{}/documents/{}",
            self.user, self.app, self.name
        )
    }

    fn validate(&self) -> Result<(), StoreError> {
        for segment in [&self.user, &self.app, &self.name] {
            let bad = segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains(['/', '\\']);
            if bad {
                return Err(StoreError::InvalidId(self.path()));
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid document id: {0}")]
    InvalidId(String),
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `Ok(None)` when the document does not exist.
    async fn read(&self, id: &DocumentId) -> Result<Option<String>, StoreError>;

    /// Replaces the whole document.
    async fn write(&self, id: &DocumentId, body: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    /// The root must already exist; a missing root reads as an unreachable store.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileDocumentStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, id: &DocumentId) -> Result<PathBuf, StoreError> {
        id.validate()?;
        Ok(self.root.join(format!("{}.json", id.path())))
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(StoreError::Unavailable(format!(
                "{} is not reachable",
                self.root.display()
            ))),
        }
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn read(&self, id: &DocumentId) -> Result<Option<String>, StoreError> {
        let path = self.document_path(id)?;
        self.ensure_root().await?;
        match fs::read_to_string(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn write(&self, id: &DocumentId, body: &str) -> Result<(), StoreError> {
        let path = self.document_path(id)?;
        self.ensure_root().await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        write_replacing(&path, body).await
    }
}

/// Writes `body` beside `path` under a random name, then renames it over
/// `path`, so readers never see a half-written file.
async fn write_replacing(path: &Path, body: &str) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", temp_suffix()));
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body)
        .await
        .map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Local cache in front of a remote store.
///
/// Writes land in the cache first. A remote write that fails because the
/// remote is unavailable is remembered as pending (on disk, next to the
/// cached copies) and flushed by [`CachedDocumentStore::reconcile`], which
/// also runs before every read.
pub struct CachedDocumentStore<S> {
    remote: S,
    cache: FileDocumentStore,
    pending_path: PathBuf,
    pending: Mutex<BTreeSet<DocumentId>>,
    persist: tokio::sync::Mutex<()>,
}

impl<S: DocumentStore> CachedDocumentStore<S> {
    /// Opens the cache, picking up writes a previous run could not deliver.
    pub fn new(remote: S, cache_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).map_err(|source| StoreError::Io {
            path: cache_dir.clone(),
            source,
        })?;
        let pending_path = cache_dir.join(PENDING_FILE);
        let pending = read_pending(&pending_path)?;
        if !pending.is_empty() {
            tracing::info!(event = "cache_pending_restored", count = pending.len());
        }
        Ok(CachedDocumentStore {
            remote,
            cache: FileDocumentStore::new(cache_dir),
            pending_path,
            pending: Mutex::new(pending),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    pub fn pending(&self) -> Vec<DocumentId> {
        lock(&self.pending).iter().cloned().collect()
    }

    /// Updates the pending set and rewrites `pending.json` when it changed.
    async fn set_pending(&self, id: &DocumentId, pending: bool) -> Result<(), StoreError> {
        let _persist = self.persist.lock().await;
        let listed: Vec<DocumentId> = {
            let mut set = lock(&self.pending);
            let changed = if pending {
                set.insert(id.clone())
            } else {
                set.remove(id)
            };
            if !changed {
                return Ok(());
            }
            set.iter().cloned().collect()
        };
        let body = serde_json::to_string_pretty(&listed).map_err(|err| StoreError::Io {
            path: self.pending_path.clone(),
            source: std::io::Error::new(ErrorKind::InvalidData, err),
        })?;
        write_replacing(&self.pending_path, &body).await
    }

    async fn clear_pending(&self, id: &DocumentId) {
        if let Err(err) = self.set_pending(id, false).await {
            tracing::warn!(event = "cache_pending_write_failed", document = %id.path(), error = %err);
        }
    }

    fn is_pending(&self, id: &DocumentId) -> bool {
        lock(&self.pending).contains(id)
    }

    /// Pushes pending cached documents to the remote. Returns how many were flushed.
    pub async fn reconcile(&self) -> usize {
        let mut flushed = 0;
        for id in self.pending() {
            let body = match self.cache.read(&id).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    self.clear_pending(&id).await;
                    continue;
                }
                Err(err) => {
                    tracing::warn!(event = "cache_read_failed", document = %id.path(), error = %err);
                    continue;
                }
            };
            match self.remote.write(&id, &body).await {
                Ok(()) => {
                    self.clear_pending(&id).await;
                    flushed += 1;
                    tracing::info!(event = "cache_reconciled", document = %id.path());
                }
                Err(err) => {
                    tracing::debug!(event = "cache_reconcile_deferred", document = %id.path(), error = %err);
                }
            }
        }
        flushed
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for CachedDocumentStore<S> {
    async fn read(&self, id: &DocumentId) -> Result<Option<String>, StoreError> {
        self.reconcile().await;
        if self.is_pending(id) {
            // Local copy is newer than anything the remote holds.
            return self.cache.read(id).await;
        }
        match self.remote.read(id).await {
            Ok(Some(body)) => {
                if let Err(err) = self.cache.write(id, &body).await {
                    tracing::warn!(event = "cache_write_failed", document = %id.path(), error = %err);
                }
                Ok(Some(body))
            }
            Ok(None) => Ok(None),
            Err(StoreError::Unavailable(reason)) => {
                tracing::warn!(event = "remote_unavailable", document = %id.path(), %reason, "serving cached copy");
                match self.cache.read(id).await? {
                    Some(body) => Ok(Some(body)),
                    None => Err(StoreError::Unavailable(reason)),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn write(&self, id: &DocumentId, body: &str) -> Result<(), StoreError> {
        self.cache.write(id, body).await?;
        match self.remote.write(id, body).await {
            Ok(()) => {
                self.clear_pending(id).await;
                Ok(())
            }
            Err(StoreError::Unavailable(reason)) => {
                tracing::warn!(event = "remote_unavailable", document = %id.path(), %reason, "write kept in cache");
                self.set_pending(id, true).await
            }
            Err(err) => Err(err),
        }
    }
}

fn read_pending(path: &Path) -> Result<BTreeSet<DocumentId>, StoreError> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let listed: Vec<DocumentId> =
        serde_json::from_str(&body).map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::InvalidData, err),
        })?;
    Ok(listed.into_iter().collect())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn temp_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}
