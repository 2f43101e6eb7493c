//! Local working copies of source repositories
//!
//! A [`RepositoryHandle`] wraps one git repository on disk and exposes two
//! read surfaces: the *pages* tree (rendered output) and the *sources* tree
//! (raw sources). Each surface is resolved lazily from a branch ref and cached
//! until the next [`RepositoryHandle::update`].
//!
//! All methods are blocking; async callers go through `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use git2::{
    AutotagOption, ErrorCode, FetchOptions, ObjectType, Oid, RemoteCallbacks, Repository, TreeWalkMode,
    TreeWalkResult,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::error::{FetchError, Result};
use super::source::BranchSet;

/// Remote names tried, in order, when resolving branch refs
const REMOTE_CANDIDATES: [&str; 2] = ["upstream", "origin"];

/// Name given to the remote of freshly cloned repositories
const CLONE_REMOTE: &str = "origin";

/// Set libgit2's process-wide connect and read timeouts for network remotes.
///
/// A zero duration leaves libgit2's own default in place.
pub fn set_transport_timeouts(connect: Duration, read: Duration) -> Result<()> {
    // SAFETY: libgit2 only reads these values when it opens a connection, and
    // they are written before the first fetch starts
    unsafe {
        if !connect.is_zero() {
            git2::opts::set_server_connect_timeout_in_milliseconds(millis(connect))?;
        }
        if !read.is_zero() {
            git2::opts::set_server_timeout_in_milliseconds(millis(read))?;
        }
    }
    Ok(())
}

fn millis(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

/// Which branch a tree is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Rendered output branch
    Pages,
    /// Raw sources branch
    Sources,
}

#[derive(Debug, Default)]
struct ResolvedTrees {
    pages: Option<Oid>,
    sources: Option<Oid>,
}

impl ResolvedTrees {
    fn slot(&mut self, surface: Surface) -> &mut Option<Oid> {
        match surface {
            Surface::Pages => &mut self.pages,
            Surface::Sources => &mut self.sources,
        }
    }
}

/// A local copy of one git repository
pub struct RepositoryHandle {
    uri: String,
    local_path: PathBuf,
    branches: BranchSet,
    remote_name: Option<String>,
    shallow: bool,
    cached_at: DateTime<Utc>,
    repo: Mutex<Repository>,
    trees: Mutex<ResolvedTrees>,
    // Dropped last so the directory outlives the open repository
    temp_dir: Option<TempDir>,
}

impl std::fmt::Debug for RepositoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryHandle")
            .field("uri", &self.uri)
            .field("local_path", &self.local_path)
            .field("branches", &self.branches)
            .field("remote_name", &self.remote_name)
            .field("managed", &self.temp_dir.is_some())
            .finish_non_exhaustive()
    }
}

impl RepositoryHandle {
    /// Open an existing repository in place and update it from its remote.
    ///
    /// Repositories without any remote are used as they are.
    pub fn open(path: &Path, branches: BranchSet) -> Result<Self> {
        Self::open_cancellable(path, branches, &AtomicBool::new(false))
    }

    /// [`open`](Self::open), giving up on the update once `cancelled` is set
    pub fn open_cancellable(path: &Path, branches: BranchSet, cancelled: &AtomicBool) -> Result<Self> {
        let repo = Repository::open(path)?;
        let remote_name = infer_remote(&repo)?;

        let handle = Self::from_parts(
            path.display().to_string(),
            path.to_path_buf(),
            branches,
            remote_name,
            false,
            repo,
        );
        handle.update_cancellable(cancelled)?;
        Ok(handle)
    }

    /// Clone the requested branches of `uri` into `path`.
    ///
    /// Only the configured branches are fetched, without tags. Remote
    /// transports get a shallow fetch; libgit2's local transport cannot do one.
    pub fn clone(uri: &str, path: &Path, branches: BranchSet) -> Result<Self> {
        Self::clone_cancellable(uri, path, branches, &AtomicBool::new(false))
    }

    /// [`clone`](Self::clone), giving up as soon as `cancelled` is set.
    ///
    /// The flag is checked from libgit2's progress callbacks, so a remote that
    /// stops sending is only abandoned once the transport read timeout expires.
    pub fn clone_cancellable(
        uri: &str,
        path: &Path,
        branches: BranchSet,
        cancelled: &AtomicBool,
    ) -> Result<Self> {
        info!("Cloning {} into {:?}", uri, path);

        let repo = Repository::init(path)?;
        repo.remote(CLONE_REMOTE, uri)?;

        let shallow = is_remote_transport(uri);
        let handle = Self::from_parts(
            uri.to_string(),
            path.to_path_buf(),
            branches,
            Some(CLONE_REMOTE.to_string()),
            shallow,
            repo,
        );
        handle.update_cancellable(cancelled)?;
        Ok(handle)
    }

    fn from_parts(
        uri: String,
        local_path: PathBuf,
        branches: BranchSet,
        remote_name: Option<String>,
        shallow: bool,
        repo: Repository,
    ) -> Self {
        Self {
            uri,
            local_path,
            branches,
            remote_name,
            shallow,
            cached_at: Utc::now(),
            repo: Mutex::new(repo),
            trees: Mutex::new(ResolvedTrees::default()),
            temp_dir: None,
        }
    }

    /// Take ownership of the directory the repository lives in; it is deleted
    /// when the handle is dropped.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: TempDir) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    /// Replace the reported source URI (the local path differs for archives)
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Source URI this handle was created from
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Directory of the working copy
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Branches this handle reads
    #[must_use]
    pub fn branches(&self) -> &BranchSet {
        &self.branches
    }

    /// Remote used for updates, if any
    #[must_use]
    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    /// When the handle was created
    #[must_use]
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Whether the handle owns (and will delete) its directory
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.temp_dir.is_some()
    }

    /// Fetch the latest state of the configured branches and forget resolved trees
    pub fn update(&self) -> Result<()> {
        self.update_cancellable(&AtomicBool::new(false))
    }

    /// [`update`](Self::update), giving up as soon as `cancelled` is set
    pub fn update_cancellable(&self, cancelled: &AtomicBool) -> Result<()> {
        if cancelled.load(Ordering::SeqCst) {
            return Err(FetchError::Cancelled);
        }

        if let Some(remote_name) = &self.remote_name {
            let repo = self.lock_repo();
            let refspecs: Vec<String> = self
                .branches
                .names()
                .into_iter()
                .map(|branch| format!("+refs/heads/{branch}:refs/remotes/{remote_name}/{branch}"))
                .collect();

            debug!("Fetching {:?} from {} ({})", refspecs, remote_name, self.uri);
            let mut remote = repo.find_remote(remote_name)?;
            remote
                .fetch(&refspecs, Some(&mut self.fetch_options(cancelled)), None)
                .map_err(|e| {
                    if cancelled.load(Ordering::SeqCst) {
                        FetchError::Cancelled
                    } else {
                        e.into()
                    }
                })?;
        } else {
            debug!("No remote for {}, skipping update", self.uri);
        }

        *self.lock_trees() = ResolvedTrees::default();
        Ok(())
    }

    /// Tree of the pages branch
    pub fn pages(&self) -> Result<TreeRef<'_>> {
        self.tree(Surface::Pages)
    }

    /// Tree of the sources branch
    pub fn sources(&self) -> Result<TreeRef<'_>> {
        self.tree(Surface::Sources)
    }

    /// Tree of the given surface, resolved on first use
    pub fn tree(&self, surface: Surface) -> Result<TreeRef<'_>> {
        let mut trees = self.lock_trees();
        let slot = trees.slot(surface);
        let commit = match *slot {
            Some(commit) => commit,
            None => {
                let branch = match surface {
                    Surface::Pages => &self.branches.pages,
                    Surface::Sources => &self.branches.sources,
                };
                let commit = self.resolve_branch(branch)?;
                *slot = Some(commit);
                commit
            }
        };

        Ok(TreeRef {
            handle: self,
            commit,
        })
    }

    /// Sources surface of a localized repository, read from `root` at the commit
    /// the localized repository pins through its gitlink at `submodule_path`
    #[must_use]
    pub fn localized_sources<'a>(
        &'a self,
        root: &'a RepositoryHandle,
        submodule_path: &'a str,
    ) -> LocalizedSources<'a> {
        LocalizedSources {
            localized: self,
            root,
            submodule_path,
        }
    }

    fn resolve_branch(&self, branch: &str) -> Result<Oid> {
        let repo = self.lock_repo();
        let candidates = self.ref_candidates(&repo, branch)?;

        for candidate in &candidates {
            match repo.find_reference(candidate) {
                Ok(reference) => return Ok(reference.peel_to_commit()?.id()),
                Err(e) if e.code() == ErrorCode::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(FetchError::MissingRef {
            candidates,
            repository: self.uri.clone(),
        })
    }

    fn ref_candidates(&self, repo: &Repository, branch: &str) -> Result<Vec<String>> {
        if repo.remotes()?.is_empty() {
            return Ok(vec![format!("refs/heads/{branch}")]);
        }

        let mut names: Vec<&str> = REMOTE_CANDIDATES.to_vec();
        if let Some(remote) = self.remote_name.as_deref() {
            if !names.contains(&remote) {
                names.push(remote);
            }
        }

        Ok(names
            .into_iter()
            .map(|remote| format!("refs/remotes/{remote}/{branch}"))
            .collect())
    }

    /// Make sure `commit` is present locally, fetching it from the remote if needed
    fn ensure_commit(&self, commit: Oid) -> Result<()> {
        let repo = self.lock_repo();
        if repo.find_commit(commit).is_ok() {
            return Ok(());
        }

        let Some(remote_name) = &self.remote_name else {
            return Err(FetchError::MissingRef {
                candidates: vec![commit.to_string()],
                repository: self.uri.clone(),
            });
        };

        info!("Fetching pinned commit {} into {}", commit, self.uri);
        let mut remote = repo.find_remote(remote_name)?;
        let never = AtomicBool::new(false);
        remote.fetch(&[commit.to_string()], Some(&mut self.fetch_options(&never)), None)?;
        repo.find_commit(commit)?;
        Ok(())
    }

    fn fetch_options<'a>(&self, cancelled: &'a AtomicBool) -> FetchOptions<'a> {
        // Returning false from a progress callback aborts the transfer
        let mut callbacks = RemoteCallbacks::new();
        callbacks.transfer_progress(move |_| !cancelled.load(Ordering::SeqCst));
        callbacks.sideband_progress(move |_| !cancelled.load(Ordering::SeqCst));

        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks);
        options.download_tags(AutotagOption::None);
        if self.shallow {
            options.depth(1);
        }
        options
    }

    fn lock_repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_trees(&self) -> MutexGuard<'_, ResolvedTrees> {
        self.trees.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pick the remote to update from: `upstream`, then `origin`, then any
fn infer_remote(repo: &Repository) -> Result<Option<String>> {
    let remotes = repo.remotes()?;
    let names: Vec<&str> = remotes.iter().flatten().collect();

    Ok(REMOTE_CANDIDATES
        .iter()
        .find(|candidate| names.contains(candidate))
        .copied()
        .or_else(|| names.first().copied())
        .map(str::to_string))
}

fn is_remote_transport(uri: &str) -> bool {
    (uri.contains("://") && !uri.starts_with("file://")) || uri.starts_with("git@")
}

/// A tree at a specific commit of a repository
#[derive(Clone, Copy)]
pub struct TreeRef<'a> {
    handle: &'a RepositoryHandle,
    commit: Oid,
}

impl std::fmt::Debug for TreeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeRef")
            .field("repository", &self.handle.uri)
            .field("commit", &self.commit)
            .finish()
    }
}

impl TreeRef<'_> {
    /// Commit the tree belongs to
    #[must_use]
    pub fn commit_id(&self) -> Oid {
        self.commit
    }

    /// Read the content of a file
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let repo = self.handle.lock_repo();
        let tree = repo.find_commit(self.commit)?.tree()?;

        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Err(self.missing(path)),
            Err(e) => return Err(e.into()),
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(self.missing(path));
        }

        let blob = repo.find_blob(entry.id())?;
        Ok(blob.content().to_vec())
    }

    /// Whether a regular file exists at `path`
    pub fn file_exists(&self, path: &str) -> Result<bool> {
        let repo = self.handle.lock_repo();
        let tree = repo.find_commit(self.commit)?.tree()?;

        match tree.get_path(Path::new(path)) {
            Ok(entry) => Ok(entry.kind() == Some(ObjectType::Blob)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Paths of all files whose path starts with `prefix`, in tree order
    pub fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.handle.lock_repo();
        let tree = repo.find_commit(self.commit)?.tree()?;

        let mut files = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() != Some(ObjectType::Blob) {
                return TreeWalkResult::Ok;
            }
            if let Some(name) = entry.name() {
                let full = format!("{dir}{name}");
                if full.starts_with(prefix) {
                    files.push(full);
                }
            }
            TreeWalkResult::Ok
        })?;

        Ok(files)
    }

    /// Commit time of the tree's commit
    pub fn committed_at(&self) -> Result<DateTime<Utc>> {
        let repo = self.handle.lock_repo();
        let commit = repo.find_commit(self.commit)?;
        Ok(DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default())
    }

    /// Commit pinned by a gitlink entry at `path`, if there is one
    pub fn gitlink(&self, path: &str) -> Result<Option<Oid>> {
        let repo = self.handle.lock_repo();
        let tree = repo.find_commit(self.commit)?.tree()?;

        match tree.get_path(Path::new(path)) {
            Ok(entry) if entry.kind() == Some(ObjectType::Commit) => Ok(Some(entry.id())),
            Ok(_) => Ok(None),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn missing(&self, path: &str) -> FetchError {
        FetchError::MissingFile {
            path: path.to_string(),
            tree: format!("{}@{}", self.handle.uri, self.commit),
        }
    }
}

/// Sources of a localized repository, served from the primary repository
#[derive(Debug, Clone, Copy)]
pub struct LocalizedSources<'a> {
    localized: &'a RepositoryHandle,
    root: &'a RepositoryHandle,
    submodule_path: &'a str,
}

impl<'a> LocalizedSources<'a> {
    /// Commit of the primary repository the localized one is pinned to, if any
    pub fn pinned_commit(&self) -> Result<Option<Oid>> {
        self.localized.sources()?.gitlink(self.submodule_path)
    }

    /// Primary sources tree at the pinned commit.
    ///
    /// Falls back to the primary's latest sources when the localized repository
    /// records no pointer.
    pub fn tree(&self) -> Result<TreeRef<'a>> {
        match self.pinned_commit()? {
            Some(commit) => {
                self.root.ensure_commit(commit)?;
                Ok(TreeRef {
                    handle: self.root,
                    commit,
                })
            }
            None => {
                warn!(
                    "No submodule pointer at '{}' in {}, using latest primary sources",
                    self.submodule_path, self.localized.uri
                );
                self.root.sources()
            }
        }
    }
}
