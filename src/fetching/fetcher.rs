//! Parallel fetching of every configured source repository

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use super::archive::unpack_repository;
use super::error::{FetchError, Result};
use super::repository::{LocalizedSources, RepositoryHandle};
use super::source::{SourceKey, SourceLocation, SourceSpec};

/// Tasks allowed to wait for a worker, per worker
const QUEUE_FACTOR: usize = 2;

/// Prefix of the directories created for clones and unpacked archives
pub const MANAGED_DIR_PREFIX: &str = "docsearch-";

/// Cancellation shared by every task of one fetch.
///
/// Blocking work started through [`run_blocking`](Self::run_blocking) is
/// tracked, so [`cancel`](Self::cancel) returns only once it has wound down
/// and dropped whatever it created.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    blocking: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Cancellation {
    /// Whether [`cancel`](Self::cancel) was called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run `work` on the blocking pool, handing it the cancellation flag.
    ///
    /// A result nobody waits for any more is dropped on the blocking thread.
    pub async fn run_blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AtomicBool) -> Result<T> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        let cancelled = self.cancelled.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let result = work(&cancelled);
            let _ = tx.send(result);
        });
        self.lock_blocking().push(handle);

        rx.await.map_err(|e| FetchError::Join(e.to_string()))?
    }

    /// Raise the flag and wait for every blocking task to return
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        let pending: Vec<JoinHandle<()>> = self.lock_blocking().drain(..).collect();
        for handle in pending {
            if let Err(e) = handle.await {
                warn!("Blocking fetch task failed: {}", e);
            }
        }
    }

    fn lock_blocking(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.blocking.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Turns a source spec into a local repository handle
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Create a fresh handle for `spec`
    async fn resolve(&self, spec: &SourceSpec, cancellation: &Cancellation) -> Result<RepositoryHandle>;

    /// Bring a cached handle up to date
    async fn refresh(&self, handle: Arc<RepositoryHandle>, cancellation: &Cancellation) -> Result<()>;
}

/// Resolves sources with git, cloning or opening them on disk
#[derive(Debug, Clone, Default)]
pub struct GitResolver {
    local_inspection: bool,
    work_dir: Option<PathBuf>,
}

impl GitResolver {
    /// Create a resolver.
    ///
    /// With `local_inspection`, filesystem paths are opened in place (archives
    /// are unpacked once) instead of being cloned.
    #[must_use]
    pub fn new(local_inspection: bool) -> Self {
        Self {
            local_inspection,
            work_dir: None,
        }
    }

    /// Create managed directories under `dir` instead of the system temp dir
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    fn resolve_blocking(
        spec: &SourceSpec,
        local_inspection: bool,
        work_dir: Option<&Path>,
        cancelled: &AtomicBool,
    ) -> Result<RepositoryHandle> {
        let location = spec.location()?;
        let branches = spec.branches.clone();

        // Dropping `dir` on any error below removes what was written so far
        match &location {
            SourceLocation::Path(path) if local_inspection && location.is_archive() => {
                let dir = managed_dir(work_dir)?;
                let root = unpack_repository(path, dir.path())?;
                Ok(RepositoryHandle::open_cancellable(&root, branches, cancelled)?
                    .with_uri(spec.uri.clone())
                    .with_temp_dir(dir))
            }
            SourceLocation::Path(path) if local_inspection => {
                info!("Opening {} in place", spec.uri);
                RepositoryHandle::open_cancellable(path, branches, cancelled)
            }
            _ => {
                let dir = managed_dir(work_dir)?;
                Ok(
                    RepositoryHandle::clone_cancellable(&spec.uri, dir.path(), branches, cancelled)?
                        .with_temp_dir(dir),
                )
            }
        }
    }
}

fn managed_dir(work_dir: Option<&Path>) -> Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(MANAGED_DIR_PREFIX);
    Ok(match work_dir {
        Some(dir) => builder.tempdir_in(dir)?,
        None => builder.tempdir()?,
    })
}

#[async_trait]
impl SourceResolver for GitResolver {
    async fn resolve(&self, spec: &SourceSpec, cancellation: &Cancellation) -> Result<RepositoryHandle> {
        let spec = spec.clone();
        let local_inspection = self.local_inspection;
        let work_dir = self.work_dir.clone();

        cancellation
            .run_blocking(move |cancelled| {
                Self::resolve_blocking(&spec, local_inspection, work_dir.as_deref(), cancelled)
            })
            .await
    }

    async fn refresh(&self, handle: Arc<RepositoryHandle>, cancellation: &Cancellation) -> Result<()> {
        cancellation
            .run_blocking(move |cancelled| handle.update_cancellable(cancelled))
            .await
    }
}

/// One fetched source
#[derive(Debug, Clone)]
pub struct FetchedSource {
    /// What was requested
    pub spec: SourceSpec,
    /// The resulting working copy
    pub handle: Arc<RepositoryHandle>,
}

/// Result of fetching every configured source
#[derive(Debug, Clone, Default)]
pub struct FetchedContent {
    sources: BTreeMap<SourceKey, FetchedSource>,
}

impl FetchedContent {
    /// Handle fetched for `key`
    #[must_use]
    pub fn get(&self, key: &SourceKey) -> Option<&Arc<RepositoryHandle>> {
        self.sources.get(key).map(|source| &source.handle)
    }

    /// Handle of the primary source
    #[must_use]
    pub fn primary(&self) -> Option<&Arc<RepositoryHandle>> {
        self.get(&SourceKey::Primary)
    }

    /// All fetched sources, primary first, then localized ones by locale
    pub fn iter(&self) -> impl Iterator<Item = &FetchedSource> {
        self.sources.values()
    }

    /// Sources tree of a localized source, pinned to the primary
    #[must_use]
    pub fn localized_sources<'a>(&'a self, source: &'a FetchedSource) -> Option<LocalizedSources<'a>> {
        let submodule = source.spec.upstream_submodule.as_deref()?;
        let root = self.primary()?;
        Some(source.handle.localized_sources(root, submodule))
    }

    /// Number of fetched sources
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether nothing was fetched
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Fetches all sources with bounded parallelism, an overall timeout and a
/// handle cache shared across calls
pub struct ContentFetcher {
    resolver: Arc<dyn SourceResolver>,
    parallelism: usize,
    timeout: Duration,
    cache_enabled: bool,
    cache: RwLock<HashMap<String, Arc<RepositoryHandle>>>,
}

impl ContentFetcher {
    /// Create a fetcher; `parallelism` of zero means one worker per CPU
    #[must_use]
    pub fn new(
        resolver: Arc<dyn SourceResolver>,
        parallelism: usize,
        timeout: Duration,
        cache_enabled: bool,
    ) -> Self {
        let parallelism = if parallelism == 0 {
            num_cpus::get()
        } else {
            parallelism
        };

        Self {
            resolver,
            parallelism,
            timeout,
            cache_enabled,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of workers
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Number of cached handles
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Fetch every source.
    ///
    /// Any failure (or the timeout) cancels the remaining tasks, releases what
    /// they created and fails the whole call, naming the source at fault.
    pub async fn fetch_all(&self, sources: &[SourceSpec]) -> Result<FetchedContent> {
        info!(
            "Fetching {} sources with parallelism {}",
            sources.len(),
            self.parallelism
        );

        let cancellation = Cancellation::default();
        let workers = Arc::new(Semaphore::new(self.parallelism));
        let slots = Arc::new(Semaphore::new(self.parallelism * (QUEUE_FACTOR + 1)));
        let mut tasks = JoinSet::new();
        let mut outstanding = BTreeSet::new();

        let submit_deadline = Instant::now() + self.timeout;
        for spec in sources {
            // Blocks while the queue is full
            let slot = match timeout_at(submit_deadline, slots.clone().acquire_owned()).await {
                Ok(Ok(slot)) => slot,
                Ok(Err(e)) => {
                    cancel(&mut tasks, &cancellation).await;
                    return Err(FetchError::Join(e.to_string()));
                }
                Err(_) => {
                    cancel(&mut tasks, &cancellation).await;
                    return Err(self.timed_out(&outstanding));
                }
            };

            let cached = if self.cache_enabled {
                self.cache.read().await.get(&spec.uri).cloned()
            } else {
                None
            };

            outstanding.insert(spec.label().to_string());
            let resolver = self.resolver.clone();
            let workers = workers.clone();
            let cancellation = cancellation.clone();
            let spec = spec.clone();

            tasks.spawn(async move {
                let _slot = slot;
                let result = match workers.acquire_owned().await {
                    Ok(_worker) => fetch_one(resolver.as_ref(), &spec, cached, &cancellation).await,
                    Err(e) => Err(FetchError::Join(e.to_string())),
                };
                (spec, result)
            });
        }

        let deadline = Instant::now() + self.timeout;
        let mut fetched = BTreeMap::new();
        loop {
            let joined = match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    cancel(&mut tasks, &cancellation).await;
                    let err = self.timed_out(&outstanding);
                    error!("{}", err);
                    return Err(err);
                }
            };

            match joined {
                Ok((spec, Ok(handle))) => {
                    debug!("Fetched {} from {}", spec.label(), spec.uri);
                    outstanding.remove(spec.label());
                    fetched.insert(spec.key.clone(), FetchedSource { spec, handle });
                }
                Ok((spec, Err(e))) => {
                    cancel(&mut tasks, &cancellation).await;
                    let err = FetchError::for_source(spec.label(), e);
                    error!("{}", err);
                    return Err(err);
                }
                Err(e) => {
                    cancel(&mut tasks, &cancellation).await;
                    return Err(FetchError::Join(e.to_string()));
                }
            }
        }

        if self.cache_enabled {
            let mut cache = self.cache.write().await;
            for source in fetched.values() {
                cache
                    .entry(source.spec.uri.clone())
                    .or_insert_with(|| source.handle.clone());
            }
        }

        info!("Fetched {} sources", fetched.len());
        Ok(FetchedContent { sources: fetched })
    }

    /// Drop every cached handle, deleting the directories they manage
    pub async fn shutdown(&self) {
        let mut cache = self.cache.write().await;
        info!("Releasing {} cached repositories", cache.len());
        cache.clear();
    }

    fn timed_out(&self, outstanding: &BTreeSet<String>) -> FetchError {
        FetchError::Timeout {
            elapsed_secs: self.timeout.as_secs(),
            outstanding: outstanding.iter().cloned().collect(),
        }
    }
}

async fn fetch_one(
    resolver: &dyn SourceResolver,
    spec: &SourceSpec,
    cached: Option<Arc<RepositoryHandle>>,
    cancellation: &Cancellation,
) -> Result<Arc<RepositoryHandle>> {
    match cached {
        Some(handle) => {
            debug!("Updating cached repository for {}", spec.label());
            resolver.refresh(handle.clone(), cancellation).await?;
            Ok(handle)
        }
        None => Ok(Arc::new(resolver.resolve(spec, cancellation).await?)),
    }
}

/// Abort in-flight tasks, then wait for them and for the blocking work they
/// started, so whatever they created is released before returning
async fn cancel<T: 'static>(tasks: &mut JoinSet<T>, cancellation: &Cancellation) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    cancellation.cancel().await;
}
