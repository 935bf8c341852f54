//! Bare-clone cache

mod git;
mod lock;
mod paths;
mod repo;
mod staleness;
mod swap;

pub use git::{CommandOutput, CommandRunner, GhCloner, GitCli, GitCloner, GitError, RemoteCloner};
pub use lock::{ExclusiveGuard, LockError, PathLockRegistry, SharedGuard};
pub use paths::{CachePaths, DEFAULT_DIR_MODE, NAMESPACE, RootError};
pub use repo::{CacheError, DEFAULT_TTL, RepoCache};
pub use staleness::{Clock, SystemClock};
