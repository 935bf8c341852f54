//! Repository identity types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Host assumed when an identifier does not name one.
pub const DEFAULT_HOST: &str = "github.com";

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0}")]
    InvalidCharacter(char),
    #[error("value cannot start with '{0}'")]
    InvalidStart(char),
    #[error("value cannot end with '{0}'")]
    InvalidEnd(char),
    #[error("expected OWNER/NAME, got '{0}'")]
    MissingSeparator(String),
    #[error("expected OWNER/NAME or HOST/OWNER/NAME, got '{0}'")]
    TooManySegments(String),
    #[error("invalid host: '{0}'")]
    InvalidHost(String),
    #[error("invalid owner: {0}")]
    InvalidOwner(#[source] Box<ParseError>),
    #[error("invalid repo: {0}")]
    InvalidRepo(#[source] Box<ParseError>),
}

/// A GitHub owner (user or organization)
///
/// Validation rules:
/// - Non-empty
/// - Alphanumeric characters and hyphens only
/// - Cannot start or end with a hyphen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Owner {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }
        if s.ends_with('-') {
            return Err(ParseError::InvalidEnd('-'));
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(ParseError::InvalidCharacter(c));
        }

        Ok(Owner(s.to_string()))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A GitHub repository name
///
/// Validation rules:
/// - Non-empty
/// - Alphanumeric characters, hyphens, underscores, and dots only
/// - Cannot start with a dot (so `.` and `..` never reach the filesystem)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo(String);

impl Repo {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Repo {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.starts_with('.') {
            return Err(ParseError::InvalidStart('.'));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
        {
            return Err(ParseError::InvalidCharacter(c));
        }

        Ok(Repo(s.to_string()))
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a specific repository on a remote host.
///
/// Accepted forms:
/// - `OWNER/NAME`
/// - `HOST/OWNER/NAME`
/// - `https://HOST/OWNER/NAME` (also `http://`, `ssh://`, `git://`)
/// - `git@HOST:OWNER/NAME`
///
/// A trailing `.git` or `/` is ignored in every form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoKey {
    /// Remote host, `None` meaning [`DEFAULT_HOST`].
    pub host: Option<String>,
    pub owner: Owner,
    pub repo: Repo,
}

impl RepoKey {
    pub fn new(owner: Owner, repo: Repo) -> Self {
        Self {
            host: None,
            owner,
            repo,
        }
    }

    /// Sets an explicit host. The default host is normalized to `None`.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.host = (!host.eq_ignore_ascii_case(DEFAULT_HOST)).then_some(host);
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    /// The HTTPS clone URL for this repository.
    pub fn https_url(&self) -> String {
        format!("https://{}/{}/{}.git", self.host(), self.owner, self.repo)
    }
}

/// Strips a URL scheme or scp-style prefix, leaving `HOST/OWNER/NAME` or
/// `OWNER/NAME`.
fn strip_remote_prefix(s: &str) -> String {
    if let Some((_, rest)) = s.split_once("://") {
        // Drop userinfo from the authority, e.g. `git@github.com/...`.
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host);
        return format!("{}/{}", host, path);
    }

    // scp-like syntax: user@host:owner/name
    if let Some((authority, path)) = s.split_once(':') {
        if !authority.contains('/') {
            let host = authority.rsplit('@').next().unwrap_or(authority);
            return format!("{}/{}", host, path);
        }
    }

    s.to_string()
}

fn validate_host(host: &str) -> Result<(), ParseError> {
    let valid = !host.is_empty()
        && !host.starts_with(['.', '-'])
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ParseError::InvalidHost(host.to_string()))
    }
}

impl FromStr for RepoKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let stripped = strip_remote_prefix(s);
        let path = stripped.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);

        let segments: Vec<&str> = path.split('/').collect();
        let (host, owner_str, repo_str) = match segments.as_slice() {
            [owner, repo] => (None, *owner, *repo),
            [host, owner, repo] => {
                validate_host(host)?;
                (Some(*host), *owner, *repo)
            }
            [_] => return Err(ParseError::MissingSeparator(s.to_string())),
            _ => return Err(ParseError::TooManySegments(s.to_string())),
        };

        let owner = owner_str
            .parse::<Owner>()
            .map_err(|e| ParseError::InvalidOwner(Box::new(e)))?;
        let repo = repo_str
            .parse::<Repo>()
            .map_err(|e| ParseError::InvalidRepo(Box::new(e)))?;

        let key = RepoKey::new(owner, repo);
        Ok(match host {
            Some(host) => key.with_host(host),
            None => key,
        })
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}/{}/{}", host, self.owner, self.repo),
            None => write!(f, "{}/{}", self.owner, self.repo),
        }
    }
}

/// Which repository a request is about, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoTarget {
    /// Already resolved.
    Key(RepoKey),
    /// An identifier string handed to the identity resolver.
    Identifier(String),
    /// The repository of the current working directory.
    Current,
}

impl From<RepoKey> for RepoTarget {
    fn from(key: RepoKey) -> Self {
        RepoTarget::Key(key)
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoTarget::Key(key) => write!(f, "{}", key),
            RepoTarget::Identifier(id) => write!(f, "{}", id),
            RepoTarget::Current => f.write_str("<current repository>"),
        }
    }
}

/// A request for a cached clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRequest {
    pub target: RepoTarget,
    /// Per-request freshness window. Only used when positive; otherwise the
    /// cache default applies.
    pub ttl: Option<Duration>,
}

impl RepoRequest {
    pub fn new(target: impl Into<RepoTarget>) -> Self {
        Self {
            target: target.into(),
            ttl: None,
        }
    }

    /// Request for an identifier such as `owner/name`.
    pub fn identifier(id: impl Into<String>) -> Self {
        Self::new(RepoTarget::Identifier(id.into()))
    }

    /// Request for the ambient repository.
    pub fn current() -> Self {
        Self::new(RepoTarget::Current)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
