use std::{fmt::Display, path::Path, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info};

use crate::{
    definition::{DefinitionError, codec},
    remote::{RemoteEntry, RemoteError, RemoteStore},
};

pub(crate) mod cache;

use cache::{LocalCache, file_mtime_ms, tunnel_name};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(
        "the local copy of {name} (mtime {local}) differs from the server (mtime {remote}); pull and compare your edits before pushing again"
    )]
    Conflict {
        name: String,
        local: i64,
        remote: i64,
    },
    #[error("could not find a tunnel matching {0}")]
    NotFound(String),
    #[error("{0} is a scripted tunnel definition, only .ini definitions are supported")]
    UnsupportedFormat(String),
    #[error("refusing to use {0:?} as a tunnel file name")]
    InvalidName(String),
    #[error("io error on {1}: {0}")]
    Io(std::io::Error, String),
    #[error("fetch task failed: {0}")]
    Join(String),
}
impl SyncError {
    pub(crate) fn io(err: std::io::Error, path: &Path) -> Self {
        SyncError::Io(err, path.display().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullKind {
    New,
    Updated,
}
impl Display for PullKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PullKind::New => f.write_str("new"),
            PullKind::Updated => f.write_str("updated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pulled {
    pub name: String,
    pub kind: PullKind,
}

/// Outcome of a pull, produced once every fetch of it has settled.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PullReport {
    /// number of definitions the server listed
    pub total: usize,
    pub pulled: Vec<Pulled>,
    pub skipped: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PushReport {
    pub name: String,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct SyncOptions {
    /// fetches in flight at once during a pull
    pub fetch_concurrency: usize,
    /// applied to every call on the remote store
    pub request_timeout: Duration,
}
impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            fetch_concurrency: 8,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, cache: LocalCache, options: SyncOptions) -> Self {
        SyncEngine {
            store,
            cache: Arc::new(cache),
            options,
        }
    }
    #[cfg(test)]
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }
    pub async fn list_remote(&self) -> Result<Vec<RemoteEntry>, SyncError> {
        debug!("requesting tunnel list from server");
        let mut listing = with_timeout(self.options.request_timeout, self.store.list()).await?;
        debug!("got {} entries", listing.len());
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }
    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        let listing = self.list_remote().await?;
        self.pull_listing(listing).await
    }
    /// Fetches every listed definition that is missing from the cache or older
    /// there than on the server. The first failing fetch aborts the pull; files
    /// written before that stay in place.
    pub async fn pull_listing(&self, listing: Vec<RemoteEntry>) -> Result<PullReport, SyncError> {
        self.cache.ensure().await?;
        let total = listing.len();
        let mut wanted = Vec::new();
        let mut skipped = 0;
        for entry in listing {
            match self.cache.modified_ms(&entry.name).await? {
                None => wanted.push((entry, PullKind::New)),
                Some(local) if local < entry.mtime => wanted.push((entry, PullKind::Updated)),
                Some(_) => skipped += 1,
            }
        }

        // the whole set of fetches is known before anything is joined
        let permits = Arc::new(Semaphore::new(self.options.fetch_concurrency.max(1)));
        let mut fetches = JoinSet::new();
        for (entry, kind) in wanted {
            let store = self.store.clone();
            let cache = self.cache.clone();
            let permits = permits.clone();
            let timeout = self.options.request_timeout;
            fetches.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Join(e.to_string()))?;
                debug!("get {}", entry.name);
                let content = with_timeout(timeout, store.fetch(&entry.name)).await?;
                if content.is_empty() {
                    return Err(RemoteError::NotRegistered(format!(
                        "empty response for {} from server - are you registered?",
                        entry.name
                    ))
                    .into());
                }
                cache.write_entry(&entry.name, content, entry.mtime).await?;
                debug!("fetched {}", entry.name);
                Ok::<_, SyncError>(Pulled {
                    name: entry.name,
                    kind,
                })
            });
        }

        let mut pulled = Vec::with_capacity(fetches.len());
        while let Some(joined) = fetches.join_next().await {
            let fetched = joined
                .map_err(|e| SyncError::Join(e.to_string()))
                .and_then(|fetched| fetched);
            match fetched {
                Ok(entry) => {
                    info!("pulled {} ({})", tunnel_name(&entry.name), entry.kind);
                    pulled.push(entry);
                }
                Err(e) => {
                    fetches.abort_all();
                    return Err(e);
                }
            }
        }
        pulled.sort_by(|a, b| a.name.cmp(&b.name));

        info!("{total} tunnel definitions in sync");
        Ok(PullReport {
            total,
            pulled,
            skipped,
        })
    }
    /// Sends a definition file to the server under its base name. The file is
    /// decoded first and nothing goes over the wire when that fails. A server
    /// copy whose mtime differs from the local one is a conflict.
    pub async fn push(&self, file: &Path) -> Result<PushReport, SyncError> {
        let base = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::InvalidName(file.display().to_string()))?
            .to_string();
        debug!("testing {}", file.display());
        let content = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| SyncError::io(e, file))?;
        codec::decode_with(&tunnel_name(&base), &content, self.cache.decode_options())?;
        debug!("it passed validation");

        let listing = self.list_remote().await?;
        if let Some(remote) = listing.iter().find(|entry| entry.name == base) {
            // the cache copy is the last version pulled from the server, a file
            // outside the cache stands for itself
            let local = match self.cache.modified_ms(&base).await? {
                Some(mtime) => Some(mtime),
                None => file_mtime_ms(file).await?,
            };
            if local != Some(remote.mtime) {
                return Err(SyncError::Conflict {
                    name: base,
                    local: local.unwrap_or_default(),
                    remote: remote.mtime,
                });
            }
        }

        debug!("sending {} bytes", content.len());
        with_timeout(self.options.request_timeout, self.store.store(&base, &content)).await?;
        info!("sent {} bytes", content.len());
        Ok(PushReport {
            name: base,
            bytes: content.len(),
        })
    }
}

async fn with_timeout<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(limit, request)
        .await
        .map_err(|_| RemoteError::Timeout)?
}
