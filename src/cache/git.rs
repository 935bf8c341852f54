//! Subprocess-backed collaborators: the git command runner and the remote
//! clone operation.
//!
//! Both run the external program with captured output and honour a
//! [`CancelToken`] by killing the child. The cache itself only sees the
//! [`CommandRunner`] and [`RemoteCloner`] traits.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::cancel::{CancelToken, Interrupt};
use crate::types::RepoKey;

/// Errors returned by external git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// The program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// Underlying IO error while waiting on the child.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The program ran and exited unsuccessfully.
    #[error("{program} {}: {stderr}", describe_status(.status))]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    /// The child was killed because the caller gave up.
    #[error("{program} was interrupted: {interrupt}")]
    Interrupted {
        program: String,
        interrupt: Interrupt,
    },
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn describe_status(status: &Option<i32>) -> String {
    match *status {
        Some(code) => format!("exited with status {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a version-control subcommand against a directory.
///
/// A non-zero exit is reported through [`CommandOutput::status`], not as an
/// error; errors mean the command could not run to completion.
pub trait CommandRunner: Send + Sync {
    /// Program name used in error messages.
    fn program(&self) -> &str;

    fn run(
        &self,
        dir: &Path,
        subcommand: &str,
        args: &[String],
        cancel: &CancelToken,
    ) -> Result<CommandOutput, GitError>;
}

/// Fetches a remote repository as a bare clone into an existing, empty
/// `dest` directory.
pub trait RemoteCloner: Send + Sync {
    fn clone_bare(&self, key: &RepoKey, dest: &Path, cancel: &CancelToken) -> Result<(), GitError>;
}

/// Reject values that git would parse as options.
fn validate_subcommand(value: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput("subcommand cannot be empty".to_string()));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "subcommand cannot start with '-': {}",
            value
        )));
    }
    if value.bytes().any(|b| b < 0x20 || b.is_ascii_whitespace()) {
        return Err(GitError::InvalidInput(format!(
            "subcommand cannot contain whitespace or control characters: {:?}",
            value
        )));
    }
    Ok(())
}

fn read_to_end(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Spawn `cmd`, capture its output, and kill it if `cancel` fires.
pub(crate) fn run_captured(
    mut cmd: Command,
    program: &str,
    cancel: &CancelToken,
) -> Result<CommandOutput, GitError> {
    if let Some(interrupt) = cancel.interrupted() {
        return Err(GitError::Interrupted {
            program: program.to_string(),
            interrupt,
        });
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let stdout = read_to_end(child.stdout.take());
    let stderr = read_to_end(child.stderr.take());

    let status = match wait_or_kill(&mut child, cancel)? {
        Ok(status) => status,
        Err(interrupt) => {
            // The readers finish once every holder of the pipes exits; they
            // are not joined so a lingering grandchild cannot block us.
            log::debug!("{} killed: {}", program, interrupt);
            return Err(GitError::Interrupted {
                program: program.to_string(),
                interrupt,
            });
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        status: status.code(),
    })
}

/// The parts of a child process `wait_or_kill` drives.
trait Reapable {
    type Status;

    fn try_wait(&mut self) -> std::io::Result<Option<Self::Status>>;

    /// Kill the process and wait for it to exit.
    fn kill_and_reap(&mut self);
}

impl Reapable for Child {
    type Status = ExitStatus;

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill_and_reap(&mut self) {
        let _ = self.kill();
        let _ = self.wait();
    }
}

/// Poll the child with exponential backoff until it exits or `cancel` fires.
/// The child is killed and reaped on every path that gives up on it.
fn wait_or_kill<C: Reapable>(
    child: &mut C,
    cancel: &CancelToken,
) -> std::io::Result<Result<C::Status, Interrupt>> {
    let mut sleep_duration = Duration::from_millis(5);
    let max_sleep = Duration::from_millis(100);

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Ok(status)),
            Ok(None) => {}
            Err(e) => {
                child.kill_and_reap();
                return Err(e);
            }
        }
        if let Some(interrupt) = cancel.interrupted() {
            child.kill_and_reap();
            return Ok(Err(interrupt));
        }
        thread::sleep(cancel.wait_slice(sleep_duration));
        sleep_duration = (sleep_duration * 2).min(max_sleep);
    }
}

fn check_success(output: CommandOutput, program: &str) -> Result<CommandOutput, GitError> {
    if output.success() {
        Ok(output)
    } else {
        Err(GitError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

// ============================================================================
// git
// ============================================================================

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self::with_program("git")
    }

    pub fn with_program(git_path: impl Into<String>) -> Self {
        Self {
            git_path: git_path.into(),
        }
    }

    /// Create a hardened Command.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd
    }

    /// `git remote get-url <remote>` in `dir`.
    pub fn remote_url(&self, dir: &Path, remote: &str) -> Result<String, GitError> {
        let output = self.run(
            dir,
            "remote",
            &["get-url".to_string(), remote.to_string()],
            &CancelToken::new(),
        )?;
        let output = check_success(output, &self.git_path)?;
        Ok(output.stdout.trim().to_string())
    }
}

impl CommandRunner for GitCli {
    fn program(&self) -> &str {
        &self.git_path
    }

    fn run(
        &self,
        dir: &Path,
        subcommand: &str,
        args: &[String],
        cancel: &CancelToken,
    ) -> Result<CommandOutput, GitError> {
        validate_subcommand(subcommand)?;

        let mut cmd = self.command();
        cmd.arg("-C").arg(dir).arg(subcommand).args(args);

        log::debug!("git -C {} {} {}", dir.display(), subcommand, args.join(" "));
        run_captured(cmd, &self.git_path, cancel)
    }
}

/// Clones over HTTPS with plain `git clone --bare`.
#[derive(Debug, Clone, Default)]
pub struct GitCloner {
    git: GitCli,
}

impl GitCloner {
    pub fn new(git: GitCli) -> Self {
        Self { git }
    }
}

impl RemoteCloner for GitCloner {
    fn clone_bare(&self, key: &RepoKey, dest: &Path, cancel: &CancelToken) -> Result<(), GitError> {
        let url = key.https_url();

        let mut cmd = self.git.command();
        cmd.args(["clone", "--bare", "--quiet", "--"])
            .arg(&url)
            .arg(dest);

        log::debug!("git clone --bare {} {}", url, dest.display());
        check_success(run_captured(cmd, &self.git.git_path, cancel)?, &self.git.git_path)?;
        Ok(())
    }
}

// ============================================================================
// gh
// ============================================================================

/// Clones through the GitHub CLI (`gh repo clone`), which uses the user's
/// gh authentication.
#[derive(Debug, Clone)]
pub struct GhCloner {
    gh_path: String,
}

impl Default for GhCloner {
    fn default() -> Self {
        Self::new()
    }
}

impl GhCloner {
    pub fn new() -> Self {
        Self::with_program("gh")
    }

    pub fn with_program(gh_path: impl Into<String>) -> Self {
        Self {
            gh_path: gh_path.into(),
        }
    }
}

impl RemoteCloner for GhCloner {
    fn clone_bare(&self, key: &RepoKey, dest: &Path, cancel: &CancelToken) -> Result<(), GitError> {
        let mut cmd = Command::new(&self.gh_path);
        cmd.env("GH_PROMPT_DISABLED", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["repo", "clone"])
            .arg(key.to_string())
            .arg(dest)
            .args(["--", "--bare", "--quiet"]);

        log::debug!("gh repo clone {} {} -- --bare", key, dest.display());
        check_success(run_captured(cmd, &self.gh_path, cancel)?, &self.gh_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn validate_subcommand_rejects_options_and_blanks() {
        assert!(validate_subcommand("describe").is_ok());
        assert!(validate_subcommand("rev-parse").is_ok());
        assert!(matches!(validate_subcommand(""), Err(GitError::InvalidInput(_))));
        assert!(matches!(validate_subcommand("-c"), Err(GitError::InvalidInput(_))));
        assert!(matches!(
            validate_subcommand("describe --tags"),
            Err(GitError::InvalidInput(_))
        ));
    }

    #[test]
    fn command_output_success() {
        let ok = CommandOutput {
            status: Some(0),
            ..Default::default()
        };
        assert!(ok.success());
        assert!(!CommandOutput::default().success());
    }

    #[test]
    fn failed_error_message_includes_stderr() {
        let err = GitError::Failed {
            program: "git".to_string(),
            status: Some(128),
            stderr: "fatal: Not a valid object name".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "git exited with status 128: fatal: Not a valid object name"
        );
    }

    #[test]
    fn spawn_failure_is_reported() {
        let cli = GitCli::with_program("definitely-not-a-real-git-binary");
        let dir = tempdir().unwrap();
        let result = cli.run(dir.path(), "status", &[], &CancelToken::new());
        assert!(matches!(result, Err(GitError::Spawn { .. })));
    }

    #[test]
    fn cancelled_token_does_not_spawn() {
        let cli = GitCli::new();
        let dir = tempdir().unwrap();
        let token = CancelToken::new();
        token.cancel();

        let result = cli.run(dir.path(), "status", &[], &token);
        assert!(matches!(
            result,
            Err(GitError::Interrupted {
                interrupt: Interrupt::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn git_runs_in_directory_and_reports_exit_status() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let cli = GitCli::new();

        let init = cli
            .run(dir.path(), "init", &args(&["--bare", "--quiet"]), &CancelToken::new())
            .unwrap();
        assert!(init.success(), "git init failed: {}", init.stderr);

        let bare = cli
            .run(dir.path(), "rev-parse", &args(&["--is-bare-repository"]), &CancelToken::new())
            .unwrap();
        assert!(bare.success());
        assert_eq!(bare.stdout.trim(), "true");

        let missing = cli
            .run(
                dir.path(),
                "rev-parse",
                &args(&["--verify", "0123456789abcdef0123456789abcdef01234567^{commit}"]),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(!missing.success());
        assert!(!missing.stderr.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn deadline_kills_long_running_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let token = CancelToken::with_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let result = run_captured(cmd, "sleep", &token);
        assert!(matches!(
            result,
            Err(GitError::Interrupted {
                interrupt: Interrupt::DeadlineExceeded,
                ..
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    /// A child whose status polling always fails.
    #[derive(Default)]
    struct BrokenChild {
        reaped: bool,
    }

    impl Reapable for BrokenChild {
        type Status = ();

        fn try_wait(&mut self) -> std::io::Result<Option<()>> {
            Err(std::io::Error::other("wait failed"))
        }

        fn kill_and_reap(&mut self) {
            self.reaped = true;
        }
    }

    #[test]
    fn wait_error_still_reaps_the_child() {
        let mut child = BrokenChild::default();
        let result = wait_or_kill(&mut child, &CancelToken::new());

        assert_eq!(result.unwrap_err().to_string(), "wait failed");
        assert!(child.reaped);
    }

    #[test]
    #[cfg(unix)]
    fn git_accepts_non_utf8_directories() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        if !git_available() {
            return;
        }
        let parent = tempdir().unwrap();
        let dir = parent.path().join(OsStr::from_bytes(b"repo-\xff"));
        if std::fs::create_dir(&dir).is_err() {
            // Some filesystems only accept UTF-8 names.
            return;
        }

        let cli = GitCli::new();
        let init = cli
            .run(&dir, "init", &args(&["--bare", "--quiet"]), &CancelToken::new())
            .unwrap();
        assert!(init.success(), "git init failed: {}", init.stderr);
        assert!(dir.join("HEAD").is_file());
    }

    #[test]
    #[ignore] // Requires network access
    fn git_cloner_clones_bare() {
        let dir = tempdir().unwrap();
        let key: RepoKey = "octocat/Hello-World".parse().unwrap();

        GitCloner::default()
            .clone_bare(&key, dir.path(), &CancelToken::new())
            .unwrap();
        assert!(dir.path().join("HEAD").is_file());
        assert!(dir.path().join("objects").is_dir());
    }
}
