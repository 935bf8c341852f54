//! Cache directory path management
//!
//! ```text
//! <user cache dir or --cache-dir>/
//! └── gh-describe/                # NAMESPACE, the cache root
//!     └── <owner>/
//!         ├── <name>/             # bare clone, one per repository
//!         └── .<name>.staging-*   # cross-filesystem swap staging, transient
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::types::RepoKey;

/// Directory segment appended to every cache root.
pub const NAMESPACE: &str = "gh-describe";

/// Default permission bits for directories the cache creates (`rwxr-x---`).
pub const DEFAULT_DIR_MODE: u32 = 0o750;

/// Create `path` and any missing parents with the given permission bits.
///
/// Existing directories keep their permissions. The mode is ignored on
/// platforms without Unix permissions.
pub fn create_dir_all_with_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path)
}

/// Errors resolving the cache root.
#[derive(Debug, thiserror::Error)]
pub enum RootError {
    #[error("failed to determine the user cache directory")]
    NoUserCacheDir,
    #[error("failed to create cache directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The directory the cache root goes under. Surrounding whitespace is
/// trimmed from UTF-8 paths; other paths are used as given.
fn base_dir(explicit: Option<&Path>) -> Result<PathBuf, RootError> {
    let explicit = explicit.map(|path| match path.to_str() {
        Some(s) => Path::new(s.trim()),
        None => path,
    });
    match explicit.filter(|path| !path.as_os_str().is_empty()) {
        Some(path) => Ok(path.to_path_buf()),
        None => dirs::cache_dir().ok_or(RootError::NoUserCacheDir),
    }
}

/// Manages filesystem paths for the cache layout.
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Wraps an already provisioned root. No directories are created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Compute and provision the cache root.
    ///
    /// A missing or blank `explicit` path means the per-user cache directory
    /// (`dirs::cache_dir()`):
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    ///
    /// [`NAMESPACE`] is appended in both cases, the tree is created with
    /// `dir_mode`, and the canonical path is returned.
    pub fn resolve(explicit: Option<&Path>, dir_mode: u32) -> Result<Self, RootError> {
        let root = base_dir(explicit)?.join(NAMESPACE);

        create_dir_all_with_mode(&root, dir_mode).map_err(|source| RootError::Create {
            path: root.clone(),
            source,
        })?;
        let root = root
            .canonicalize()
            .map_err(|source| RootError::Create { path: root, source })?;

        log::debug!("cache root: {}", root.display());
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the owner directory: `{root}/{owner}`
    pub fn owner_dir(&self, key: &RepoKey) -> PathBuf {
        self.root.join(key.owner.as_str())
    }

    /// Returns the cache entry for a repository: `{root}/{owner}/{name}`
    pub fn entry_dir(&self, key: &RepoKey) -> PathBuf {
        self.owner_dir(key).join(key.repo.as_str())
    }

    /// Prefix for staging directories next to an entry: `.{name}.staging-`
    pub fn staging_prefix(&self, key: &RepoKey) -> String {
        format!(".{}.staging-", key.repo)
    }
}
