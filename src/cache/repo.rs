//! Repository cache manager
//!
//! `RepoCache` hands out paths to bare clones under the cache root, cloning
//! or refreshing them when they are missing or stale.
//!
//! Refresh protocol for one entry:
//! 1. Under a shared lock, stat the entry. Fresh entries are returned as is.
//! 2. With no lock held, clone into a new temporary directory outside the
//!    cache tree (and stage a copy next to the entry if the temp directory is
//!    on another filesystem).
//! 3. Under an exclusive lock, remove the old entry and rename the new clone
//!    into place.
//!
//! Concurrent refreshes of the same entry are not coalesced; the last rename
//! wins, and every rename installs a complete clone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;

use super::git::{GitError, RemoteCloner};
use super::lock::{LockError, PathLockRegistry};
use super::paths::{CachePaths, DEFAULT_DIR_MODE, NAMESPACE, RootError, create_dir_all_with_mode};
use super::staleness::{self, Clock, SystemClock};
use super::swap;
use crate::cancel::CancelToken;
use crate::config::CacheConfig;
use crate::identity::{IdentityResolver, ResolveError};
use crate::types::{RepoKey, RepoRequest, RepoTarget};

/// Default freshness window for cached clones.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Empty or unparseable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The repository identity could not be determined.
    #[error("failed to resolve repository: {0}")]
    Resolution(#[source] ResolveError),
    /// A filesystem operation failed.
    #[error("failed to {op} {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The remote clone failed. The existing entry, if any, is untouched.
    #[error("failed to clone {repo}: {source}")]
    Clone {
        repo: RepoKey,
        #[source]
        source: GitError,
    },
    /// The external command could not run or exited unsuccessfully.
    #[error("git {subcommand} failed for {repo}: {source}")]
    Command {
        repo: RepoKey,
        subcommand: String,
        #[source]
        source: GitError,
    },
    /// Waiting for an entry's lock was cancelled or timed out.
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: LockError,
    },
}

impl CacheError {
    fn fs(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> CacheError {
        let path = path.to_path_buf();
        move |source| CacheError::Filesystem { op, path, source }
    }

    fn lock(path: &Path) -> impl FnOnce(LockError) -> CacheError {
        let path = path.to_path_buf();
        move |source| CacheError::Lock { path, source }
    }

    /// Captured standard error of a failed command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CacheError::Command {
                source: GitError::Failed { stderr, .. },
                ..
            }
            | CacheError::Clone {
                source: GitError::Failed { stderr, .. },
                ..
            } => Some(stderr),
            _ => None,
        }
    }

    /// Whether the operation stopped because its cancel token fired.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            CacheError::Lock { .. }
                | CacheError::Clone {
                    source: GitError::Interrupted { .. },
                    ..
                }
                | CacheError::Command {
                    source: GitError::Interrupted { .. },
                    ..
                }
        )
    }
}

impl From<RootError> for CacheError {
    fn from(err: RootError) -> Self {
        match err {
            RootError::NoUserCacheDir => CacheError::Filesystem {
                op: "determine",
                path: PathBuf::from("user cache directory"),
                source: io::Error::new(io::ErrorKind::NotFound, "no user cache directory"),
            },
            RootError::Create { path, source } => CacheError::Filesystem {
                op: "create cache directory",
                path,
                source,
            },
        }
    }
}

impl From<ResolveError> for CacheError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Invalid { .. } => CacheError::InvalidInput(err.to_string()),
            ResolveError::NoAmbient(_) => CacheError::Resolution(err),
        }
    }
}

/// Cache manager for bare clones of remote repositories.
pub struct RepoCache {
    paths: CachePaths,
    dir_mode: u32,
    default_ttl: Duration,
    temp_base: Option<PathBuf>,
    /// Stage through the entry's parent even when a direct rename would work.
    always_stage: bool,
    locks: Arc<PathLockRegistry>,
    cloner: Arc<dyn RemoteCloner>,
    resolver: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
}

impl RepoCache {
    /// Create a cache manager rooted at already provisioned `paths`.
    pub fn new(
        paths: CachePaths,
        cloner: Arc<dyn RemoteCloner>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            paths,
            dir_mode: DEFAULT_DIR_MODE,
            default_ttl: DEFAULT_TTL,
            temp_base: None,
            always_stage: false,
            locks: Arc::new(PathLockRegistry::new()),
            cloner,
            resolver,
            clock: Arc::new(SystemClock),
        }
    }

    /// Resolve and provision the cache root from `config`, then build the
    /// manager.
    pub fn from_config(
        config: &CacheConfig,
        cloner: Arc<dyn RemoteCloner>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self, CacheError> {
        let paths = CachePaths::resolve(config.root.as_deref(), config.dir_mode)?;
        let mut cache = Self::new(paths, cloner, resolver)
            .with_dir_mode(config.dir_mode)
            .with_default_ttl(config.default_ttl);
        if let Some(base) = &config.temp_base {
            cache = cache.with_temp_base(base.clone());
        }
        Ok(cache)
    }

    /// Set the freshness window used when a request has no positive override.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the permission bits for directories created under the root.
    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    /// Clone into temporary directories under `base` instead of the system
    /// temp directory. `base` must be outside the cache root.
    pub fn with_temp_base(mut self, base: PathBuf) -> Self {
        self.temp_base = Some(base);
        self
    }

    /// Share a lock table with other components.
    pub fn with_locks(mut self, locks: Arc<PathLockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    fn with_staging_forced(mut self) -> Self {
        self.always_stage = true;
        self
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// The lock table guarding this cache's entries.
    pub fn locks(&self) -> &Arc<PathLockRegistry> {
        &self.locks
    }

    /// Turn a request target into a concrete identity.
    pub fn resolve(&self, target: &RepoTarget) -> Result<RepoKey, CacheError> {
        match target {
            RepoTarget::Key(key) => Ok(key.clone()),
            RepoTarget::Identifier(id) if id.trim().is_empty() => Err(CacheError::InvalidInput(
                "repository identifier must not be empty".to_string(),
            )),
            RepoTarget::Identifier(id) => Ok(self.resolver.parse(id)?),
            RepoTarget::Current => Ok(self.resolver.current()?),
        }
    }

    /// Return the path of a fresh bare clone for `request`, cloning or
    /// refreshing as needed.
    pub fn ensure_fresh(&self, request: &RepoRequest) -> Result<PathBuf, CacheError> {
        self.ensure_fresh_with_cancel(request, &CancelToken::new())
    }

    /// Like [`RepoCache::ensure_fresh`], giving up when `cancel` fires.
    pub fn ensure_fresh_with_cancel(
        &self,
        request: &RepoRequest,
        cancel: &CancelToken,
    ) -> Result<PathBuf, CacheError> {
        let key = self.resolve(&request.target)?;
        self.ensure_key_fresh(&key, request.ttl, cancel)
    }

    /// [`RepoCache::ensure_fresh`] for an already resolved identity.
    pub fn ensure_key_fresh(
        &self,
        key: &RepoKey,
        ttl: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<PathBuf, CacheError> {
        let output = self.paths.entry_dir(key);
        let ttl = staleness::effective_ttl(self.default_ttl, ttl);

        if self.is_fresh(&output, ttl, cancel)? {
            log::debug!("repo cache hit for {} at {}", key, output.display());
            return Ok(output);
        }

        self.refresh(key, &output, cancel)?;
        log::info!("refreshed {} at {}", key, output.display());
        Ok(output)
    }

    /// Stat `output` under a shared lock and compare its age against `ttl`.
    fn is_fresh(&self, output: &Path, ttl: Duration, cancel: &CancelToken) -> Result<bool, CacheError> {
        let metadata = {
            let _guard = self
                .locks
                .acquire_shared(output, cancel)
                .map_err(CacheError::lock(output))?;
            fs::metadata(output)
        };

        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("no cache entry at {}", output.display());
                return Ok(false);
            }
            Err(e) => return Err(CacheError::fs("stat", output)(e)),
        };
        if !metadata.is_dir() {
            log::warn!("cache entry {} is not a directory, replacing it", output.display());
            return Ok(false);
        }

        let modified = metadata.modified().map_err(CacheError::fs("stat", output))?;
        let now = self.clock.now();
        let fresh = staleness::is_fresh(modified, now, ttl);
        log::debug!(
            "cache entry {} is {:?} old (ttl {:?}): {}",
            output.display(),
            staleness::age(modified, now),
            ttl,
            if fresh { "fresh" } else { "stale" }
        );
        Ok(fresh)
    }

    fn temp_dir(&self) -> io::Result<TempDir> {
        let prefix = format!("{}-", NAMESPACE);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.temp_base {
            Some(base) => builder.tempdir_in(base),
            None => builder.tempdir(),
        }
    }

    /// Clone `key` outside any lock, then swap it into `output`.
    fn refresh(&self, key: &RepoKey, output: &Path, cancel: &CancelToken) -> Result<(), CacheError> {
        let temp = self
            .temp_dir()
            .map_err(CacheError::fs("create temporary directory for", output))?;

        log::debug!("cloning {} into {}", key, temp.path().display());
        // On failure `temp` drops here and takes the partial clone with it.
        self.cloner
            .clone_bare(key, temp.path(), cancel)
            .map_err(|source| CacheError::Clone {
                repo: key.clone(),
                source,
            })?;

        let parent = self.paths.owner_dir(key);
        create_dir_all_with_mode(&parent, self.dir_mode)
            .map_err(CacheError::fs("create directory", &parent))?;

        let same_fs = swap::same_filesystem(temp.path(), &parent)
            .map_err(CacheError::fs("stat", &parent))?;
        let staging = if same_fs && !self.always_stage {
            None
        } else {
            log::debug!("staging {} in {}", key, parent.display());
            let staged = swap::stage_in(&parent, &self.paths.staging_prefix(key), temp.path())
                .map_err(CacheError::fs("stage clone in", &parent))?;
            Some(staged)
        };
        let source = staging.as_ref().map_or(temp.path(), |s| s.path());

        self.swap(source, output, cancel)
    }

    /// Replace `output` with `source` under an exclusive lock.
    fn swap(&self, source: &Path, output: &Path, cancel: &CancelToken) -> Result<(), CacheError> {
        let _guard = self
            .locks
            .acquire_exclusive(output, cancel)
            .map_err(CacheError::lock(output))?;

        swap::remove_entry(output).map_err(CacheError::fs("remove", output))?;
        fs::rename(source, output).map_err(CacheError::fs("rename clone into", output))?;

        if let Err(e) = staleness::touch_dir(output, self.clock.now()) {
            log::warn!("failed to reset mtime of {}: {}", output.display(), e);
        }
        Ok(())
    }
}
