use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Owner: alphanumerics and single hyphens, at most 39 chars (GitHub's limit).
/// Repository: alphanumerics, `.`, `_`, `-`.
static REPO_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,38}/[A-Za-z0-9._-]{1,100}$")
        .expect("repository name pattern compiles")
});

/// A chat user who completed the OAuth handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    /// Chat identifier exactly as the transport reported it.
    pub chat_id: String,
    pub login: String,
    pub name: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to register a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub chat_id: String,
    pub login: String,
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchLink {
    pub id: i64,
    pub user_id: i64,
    pub repository_id: i64,
    pub watermark: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One row of the per-cycle snapshot: a link joined with its user and repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub link_id: i64,
    pub user: User,
    pub repository: Repository,
    pub watermark: DateTime<Utc>,
}

/// GitHub profile returned for an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub login: String,
}

/// Repository as reported by GitHub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub name: String,
    pub full_name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub author_name: String,
    pub author_email: String,
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    pub message: String,
    pub html_url: Option<String>,
}

impl Commit {
    /// Timestamp used to advance a watermark past this commit.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.authored_at.max(self.committed_at)
    }

    pub fn short_sha(&self) -> &str {
        let end = self
            .sha
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.sha.len());
        &self.sha[..end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository name {0:?}, expected owner/repo")]
pub struct InvalidRepoName(pub String);

/// A validated `owner/repo` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoName(String);

impl RepoName {
    pub fn parse(input: &str) -> Result<Self, InvalidRepoName> {
        let trimmed = input.trim();
        if !REPO_NAME_RE.is_match(trimmed) {
            return Err(InvalidRepoName(input.to_string()));
        }
        let (owner, repo) = trimmed
            .split_once('/')
            .ok_or_else(|| InvalidRepoName(input.to_string()))?;
        if owner.ends_with('-') || owner.contains("--") || repo == "." || repo == ".." {
            return Err(InvalidRepoName(input.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn owner(&self) -> &str {
        self.0.split_once('/').map(|(o, _)| o).unwrap_or_default()
    }

    pub fn repo(&self) -> &str {
        self.0.split_once('/').map(|(_, r)| r).unwrap_or_default()
    }
}

impl FromStr for RepoName {
    type Err = InvalidRepoName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn repo_name_grammar() {
        assert!(RepoName::parse("owner-name/repo_name").is_ok());
        assert!(RepoName::parse("rust-lang/rust.vim").is_ok());
        assert!(RepoName::parse("  a/b ").is_ok());

        assert!(RepoName::parse("owner").is_err());
        assert!(RepoName::parse("owner/repo/extra").is_err());
        assert!(RepoName::parse("/repo").is_err());
        assert!(RepoName::parse("owner/").is_err());
        assert!(RepoName::parse("-owner/repo").is_err());
        assert!(RepoName::parse("owner-/repo").is_err());
        assert!(RepoName::parse("own er/repo").is_err());
        assert!(RepoName::parse("owner/..").is_err());
    }

    #[test]
    fn repo_name_parts() {
        let name: RepoName = "octo/hello".parse().unwrap();
        assert_eq!(name.owner(), "octo");
        assert_eq!(name.repo(), "hello");
        assert_eq!(name.to_string(), "octo/hello");
    }

    #[test]
    fn observed_at_takes_later_timestamp() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut commit = Commit {
            sha: "0123456789abcdef".into(),
            author_name: "a".into(),
            author_email: "a@example.com".into(),
            authored_at: early,
            committed_at: late,
            message: "m".into(),
            html_url: None,
        };
        assert_eq!(commit.observed_at(), late);
        commit.authored_at = late;
        commit.committed_at = early;
        assert_eq!(commit.observed_at(), late);
        assert_eq!(commit.short_sha(), "0123456");
    }
}
