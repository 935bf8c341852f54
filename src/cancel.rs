//! Cooperative cancellation for lock waits and subprocesses.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Why an operation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Cancelled => f.write_str("cancelled"),
            Interrupt::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// A cancel flag shared between clones, plus an optional deadline.
///
/// Cloning a token shares the flag; `cancel()` on any clone is seen by all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that is never cancelled unless `cancel()` is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().child_with_timeout(timeout)
    }

    /// Shares this token's flag but adds (or tightens) a deadline.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the interrupt, if any, that should stop the caller now.
    pub fn interrupted(&self) -> Option<Interrupt> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some(Interrupt::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Interrupt::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.interrupted().is_some()
    }

    /// Time left before the deadline, capped at `max`.
    pub(crate) fn wait_slice(&self, max: Duration) -> Duration {
        match self.deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(max),
            None => max,
        }
    }
}
