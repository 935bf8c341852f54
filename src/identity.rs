//! Repository identity resolution.

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::{GitCli, GitError};
use crate::types::{ParseError, RepoKey};

/// Environment variable naming the repository when none is given explicitly.
pub const REPO_ENV: &str = "GH_REPO";

/// Errors resolving a repository identity.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The identifier was given but is not a valid repository identity.
    #[error("invalid repository identifier '{identifier}': {source}")]
    Invalid {
        identifier: String,
        #[source]
        source: ParseError,
    },
    /// No identifier was given and none could be discovered.
    #[error("could not determine the current repository: {0}")]
    NoAmbient(String),
}

/// Turns identifiers into repository identities.
pub trait IdentityResolver: Send + Sync {
    /// Parse an explicit identifier such as `owner/name`.
    fn parse(&self, identifier: &str) -> Result<RepoKey, ResolveError>;

    /// Discover the repository the caller is working in.
    fn current(&self) -> Result<RepoKey, ResolveError>;
}

/// Resolves identities the way the GitHub CLI does: `GH_REPO` first, then the
/// `origin` remote of the repository in the working directory.
#[derive(Debug, Clone)]
pub struct GhResolver {
    git: GitCli,
    dir: PathBuf,
    env_repo: Option<String>,
    remote: String,
}

impl GhResolver {
    /// Resolver for the process's working directory and environment.
    pub fn from_env() -> Self {
        Self {
            git: GitCli::new(),
            dir: PathBuf::from("."),
            env_repo: std::env::var(REPO_ENV).ok(),
            remote: "origin".to_string(),
        }
    }

    /// Discover from `dir` instead of the working directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Override the `GH_REPO` value captured at construction.
    pub fn with_env_repo(mut self, env_repo: Option<String>) -> Self {
        self.env_repo = env_repo;
        self
    }

    pub fn with_git(mut self, git: GitCli) -> Self {
        self.git = git;
        self
    }
}

impl IdentityResolver for GhResolver {
    fn parse(&self, identifier: &str) -> Result<RepoKey, ResolveError> {
        identifier
            .parse()
            .map_err(|source| ResolveError::Invalid {
                identifier: identifier.to_string(),
                source,
            })
    }

    fn current(&self) -> Result<RepoKey, ResolveError> {
        if let Some(repo) = self.env_repo.as_deref().filter(|r| !r.trim().is_empty()) {
            log::debug!("using {}={}", REPO_ENV, repo);
            return self.parse(repo);
        }

        let url = self
            .git
            .remote_url(&self.dir, &self.remote)
            .map_err(|e| match e {
                GitError::Failed { stderr, .. } => ResolveError::NoAmbient(format!(
                    "no '{}' remote in {}: {}",
                    self.remote,
                    self.dir.display(),
                    stderr
                )),
                other => ResolveError::NoAmbient(other.to_string()),
            })?;
        log::debug!("{} remote: {}", self.remote, url);

        url.parse().map_err(|e| {
            ResolveError::NoAmbient(format!("remote URL '{}' is not a repository: {}", url, e))
        })
    }
}
