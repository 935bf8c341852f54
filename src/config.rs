//! Cache configuration and duration parsing.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{DEFAULT_DIR_MODE, DEFAULT_TTL};

/// Settings for a [`crate::cache::RepoCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Base directory for the cache. `None` or blank means the user cache
    /// directory.
    pub root: Option<PathBuf>,
    /// Permission bits for directories created under the root.
    pub dir_mode: u32,
    /// Freshness window for requests without a positive override.
    pub default_ttl: Duration,
    /// Where temporary clones are made. `None` means the system temp
    /// directory.
    pub temp_base: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            dir_mode: DEFAULT_DIR_MODE,
            default_ttl: DEFAULT_TTL,
            temp_base: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_temp_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.temp_base = Some(base.into());
        self
    }
}

/// Parse a duration like `300`, `300s`, `5m`, `2h` or `1d`. A bare number is
/// seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    if digits.is_empty() {
        return Err(format!("duration must start with a number: '{}'", input));
    }

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("duration is too large: '{}'", input))?;
    let multiplier = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => {
            return Err(format!(
                "unknown duration unit '{}' (expected s, m, h or d)",
                other
            ));
        }
    };

    value
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration is too large: '{}'", input))
}

/// Render a duration for humans, coarsely (`5m 0s`, `2h 1m`). The output is
/// not meant to be parsed back.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
