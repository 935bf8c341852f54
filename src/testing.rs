//! Deterministic collaborators for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use crate::cache::{Clock, CommandOutput, CommandRunner, GitError, RemoteCloner};
use crate::cancel::CancelToken;
use crate::identity::{IdentityResolver, ResolveError};
use crate::types::RepoKey;

/// Files every fake clone writes, each containing the clone's generation.
const GENERATION_FILES: [&str; 3] = ["GENERATION", "refs/tags/GENERATION", "objects/GENERATION"];
/// Written last; its presence means the clone finished.
const COMPLETE_MARKER: &str = "packed-refs";

/// Generation number recorded in a fake clone.
pub fn read_generation(entry: &Path) -> usize {
    fs::read_to_string(entry.join(GENERATION_FILES[0]))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

/// A wall clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

/// Blocks fake clones until opened.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.inner.0.lock().unwrap().open = true;
        self.inner.1.notify_all();
    }

    pub fn close(&self) {
        self.inner.0.lock().unwrap().open = false;
    }

    /// Wait until a clone is blocked on this gate.
    pub fn wait_entered(&self) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock().unwrap();
        while state.waiting == 0 {
            state = cond.wait(state).unwrap();
        }
    }

    fn pass(&self) {
        let (lock, cond) = &*self.inner;
        let mut state = lock.lock().unwrap();
        state.waiting += 1;
        cond.notify_all();
        while !state.open {
            state = cond.wait(state).unwrap();
        }
        state.waiting -= 1;
    }
}

/// Remote clone stand-in that writes a small bare-repository layout.
#[derive(Debug, Default)]
pub struct FakeCloner {
    calls: AtomicUsize,
    failure: Mutex<Option<String>>,
    gate: Option<(String, Gate)>,
    delay: Duration,
}

impl FakeCloner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block clones of repositories named `repo` on `gate`.
    pub fn with_gate(mut self, repo: &str, gate: Gate) -> Self {
        self.gate = Some((repo.to_string(), gate));
        self
    }

    /// Pause between writing files, widening the window for torn reads.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make subsequent clones fail with `stderr`.
    pub fn fail_with(&self, stderr: &str) {
        *self.failure.lock().unwrap() = Some(stderr.to_string());
    }

    /// Number of clones attempted (not counting cancelled ones).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether `entry` holds a finished clone whose files all agree.
    pub fn is_complete(entry: &Path) -> bool {
        if !entry.join(COMPLETE_MARKER).is_file() {
            return false;
        }
        let generations: Vec<String> = GENERATION_FILES
            .iter()
            .map(|f| fs::read_to_string(entry.join(f)).unwrap_or_default())
            .collect();
        !generations[0].is_empty() && generations.iter().all(|g| g == &generations[0])
    }
}

impl RemoteCloner for FakeCloner {
    fn clone_bare(&self, key: &RepoKey, dest: &Path, cancel: &CancelToken) -> Result<(), GitError> {
        if let Some(interrupt) = cancel.interrupted() {
            return Err(GitError::Interrupted {
                program: "fake-clone".to_string(),
                interrupt,
            });
        }
        let generation = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((repo, gate)) = &self.gate {
            if key.repo.as_str() == repo {
                gate.pass();
            }
        }

        if let Some(stderr) = self.failure.lock().unwrap().clone() {
            // Leave a partial clone behind, as a real failed clone might.
            fs::write(dest.join("HEAD"), "ref: refs/heads/main\n")?;
            return Err(GitError::Failed {
                program: "fake-clone".to_string(),
                status: Some(128),
                stderr,
            });
        }

        fs::write(dest.join("HEAD"), "ref: refs/heads/main\n")?;
        fs::create_dir_all(dest.join("refs").join("tags"))?;
        fs::create_dir_all(dest.join("objects"))?;
        for file in GENERATION_FILES {
            std::thread::sleep(self.delay);
            fs::write(dest.join(file), generation.to_string())?;
        }
        fs::write(dest.join(COMPLETE_MARKER), format!("# {}\n", key))?;
        Ok(())
    }
}

type Responder = dyn Fn(&Path, &str, &[String]) -> CommandOutput + Send + Sync;

/// Command runner stand-in that checks it always runs against a complete
/// entry, before and after a simulated run time.
pub struct FakeRunner {
    respond: Box<Responder>,
    duration: Duration,
    calls: Mutex<Vec<(PathBuf, String, Vec<String>)>>,
    torn: AtomicUsize,
}

impl FakeRunner {
    pub fn new(respond: impl Fn(&Path, &str, &[String]) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            duration: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            torn: AtomicUsize::new(0),
        }
    }

    /// Behaves like `git describe --tags` on a repository where `sha` is
    /// tagged `tag`.
    pub fn describe(sha: &'static str, tag: &'static str) -> Self {
        Self::new(move |_, subcommand, args| {
            if subcommand == "describe" && args.iter().any(|a| a == sha) {
                success(&format!("{}\n", tag))
            } else {
                failure(128, &format!("fatal: Not a valid object name {}\n", args.join(" ")))
            }
        })
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn calls(&self) -> Vec<(PathBuf, String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Runs that saw a missing, partial, or changing entry.
    pub fn torn_reads(&self) -> usize {
        self.torn.load(Ordering::SeqCst)
    }
}

impl CommandRunner for FakeRunner {
    fn program(&self) -> &str {
        "fake-git"
    }

    fn run(
        &self,
        dir: &Path,
        subcommand: &str,
        args: &[String],
        cancel: &CancelToken,
    ) -> Result<CommandOutput, GitError> {
        if let Some(interrupt) = cancel.interrupted() {
            return Err(GitError::Interrupted {
                program: "fake-git".to_string(),
                interrupt,
            });
        }
        self.calls
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), subcommand.to_string(), args.to_vec()));

        let before = FakeCloner::is_complete(dir).then(|| read_generation(dir));
        std::thread::sleep(self.duration);
        let after = FakeCloner::is_complete(dir).then(|| read_generation(dir));
        if before.is_none() || before != after {
            self.torn.fetch_add(1, Ordering::SeqCst);
        }

        Ok((self.respond)(dir, subcommand, args))
    }
}

pub fn success(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status: Some(0),
    }
}

pub fn failure(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        status: Some(status),
    }
}

/// Resolver with a fixed ambient repository.
pub struct StaticResolver {
    current: Option<String>,
}

impl StaticResolver {
    pub fn new(current: Option<&str>) -> Self {
        Self {
            current: current.map(str::to_string),
        }
    }
}

impl IdentityResolver for StaticResolver {
    fn parse(&self, identifier: &str) -> Result<RepoKey, ResolveError> {
        identifier.parse().map_err(|source| ResolveError::Invalid {
            identifier: identifier.to_string(),
            source,
        })
    }

    fn current(&self) -> Result<RepoKey, ResolveError> {
        match &self.current {
            Some(repo) => self.parse(repo),
            None => Err(ResolveError::NoAmbient("not inside a repository".to_string())),
        }
    }
}
