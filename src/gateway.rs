//! Runs version-control subcommands against fresh cache entries.

use std::sync::Arc;

use crate::cache::{CacheError, CommandRunner, GitError, RepoCache};
use crate::cancel::CancelToken;
use crate::types::RepoRequest;

/// Runs git subcommands inside cached bare clones.
///
/// Every run first makes sure the entry is fresh, then holds a shared lock on
/// it for the lifetime of the command so a concurrent refresh cannot swap the
/// directory out from under it.
pub struct CommandGateway {
    cache: Arc<RepoCache>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandGateway {
    pub fn new(cache: Arc<RepoCache>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cache, runner }
    }

    pub fn cache(&self) -> &Arc<RepoCache> {
        &self.cache
    }

    /// Run `subcommand args...` in the entry for `request` and return its
    /// trimmed standard output.
    pub fn run(
        &self,
        request: &RepoRequest,
        subcommand: &str,
        args: &[String],
    ) -> Result<String, CacheError> {
        self.run_with_cancel(request, subcommand, args, &CancelToken::new())
    }

    /// Like [`CommandGateway::run`], killing the command when `cancel` fires.
    pub fn run_with_cancel(
        &self,
        request: &RepoRequest,
        subcommand: &str,
        args: &[String],
        cancel: &CancelToken,
    ) -> Result<String, CacheError> {
        if subcommand.trim().is_empty() {
            return Err(CacheError::InvalidInput(
                "subcommand must not be empty".to_string(),
            ));
        }

        let key = self.cache.resolve(&request.target)?;
        let entry = self.cache.ensure_key_fresh(&key, request.ttl, cancel)?;

        let _guard = self
            .cache
            .locks()
            .acquire_shared(&entry, cancel)
            .map_err(|source| CacheError::Lock {
                path: entry.clone(),
                source,
            })?;

        log::debug!("running git {} for {}", subcommand, key);
        let command_error = |source: GitError| CacheError::Command {
            repo: key.clone(),
            subcommand: subcommand.to_string(),
            source,
        };
        let output = self
            .runner
            .run(&entry, subcommand, args, cancel)
            .map_err(command_error)?;

        if !output.success() {
            return Err(command_error(GitError::Failed {
                program: self.runner.program().to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            }));
        }
        Ok(output.stdout.trim().to_string())
    }

    /// `git describe args...`
    pub fn describe(&self, request: &RepoRequest, args: &[String]) -> Result<String, CacheError> {
        self.run(request, "describe", args)
    }

    /// `git rev-parse args...`
    pub fn rev_parse(&self, request: &RepoRequest, args: &[String]) -> Result<String, CacheError> {
        self.run(request, "rev-parse", args)
    }

    /// `git rev-list args...`
    pub fn rev_list(&self, request: &RepoRequest, args: &[String]) -> Result<String, CacheError> {
        self.run(request, "rev-list", args)
    }
}
