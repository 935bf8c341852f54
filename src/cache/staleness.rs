//! Staleness checking for cache entries.
//!
//! An entry's age is `now - mtime`, where `now` comes from an injectable
//! [`Clock`]. Nothing about freshness is remembered between calls.

use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// The freshness window for one request: the override when it is positive,
/// otherwise the cache default.
pub fn effective_ttl(default_ttl: Duration, override_ttl: Option<Duration>) -> Duration {
    override_ttl
        .filter(|ttl| !ttl.is_zero())
        .unwrap_or(default_ttl)
}

/// Age of an entry modified at `modified`. An mtime in the future counts as
/// age zero.
pub fn age(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or(Duration::ZERO)
}

/// Whether an entry modified at `modified` is still fresh. A zero TTL is
/// never fresh.
pub fn is_fresh(modified: SystemTime, now: SystemTime, ttl: Duration) -> bool {
    age(modified, now) < ttl
}

/// Set a directory's mtime, resetting its staleness clock.
pub fn touch_dir(path: &Path, at: SystemTime) -> io::Result<()> {
    filetime::set_file_mtime(path, FileTime::from_system_time(at))
}
