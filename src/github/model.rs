//! Wire types for the subset of the GitHub REST API the bot reads.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::GithubError;
use crate::model::{Commit, Identity, RemoteRepository};

#[derive(Debug, Deserialize)]
pub struct AccessTokenResp {
    pub access_token: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserResp {
    pub login: String,
    pub name: Option<String>,
}

impl From<UserResp> for Identity {
    fn from(resp: UserResp) -> Self {
        let name = resp
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| resp.login.clone());
        Identity {
            name,
            login: resp.login,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RepoResp {
    pub name: String,
    pub full_name: String,
    pub updated_at: DateTime<Utc>,
}

impl From<RepoResp> for RemoteRepository {
    fn from(resp: RepoResp) -> Self {
        RemoteRepository {
            name: resp.name,
            full_name: resp.full_name,
            updated_at: resp.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommitItem {
    pub sha: String,
    pub html_url: Option<String>,
    pub commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
pub struct CommitDetail {
    pub author: Option<Signature>,
    pub committer: Option<Signature>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct Signature {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl TryFrom<CommitItem> for Commit {
    type Error = GithubError;

    fn try_from(item: CommitItem) -> Result<Self, Self::Error> {
        let author = item.commit.author.as_ref();
        let committer = item.commit.committer.as_ref();
        let authored_at = author.and_then(|s| s.date);
        let committed_at = committer.and_then(|s| s.date);
        let (authored_at, committed_at) = match (authored_at, committed_at) {
            (Some(a), Some(c)) => (a, c),
            (Some(a), None) => (a, a),
            (None, Some(c)) => (c, c),
            (None, None) => {
                return Err(GithubError::Malformed(format!(
                    "commit {} has no author or committer date",
                    item.sha
                )))
            }
        };
        let author_name = author
            .and_then(|s| s.name.clone())
            .or_else(|| committer.and_then(|s| s.name.clone()))
            .unwrap_or_default();
        let author_email = author
            .and_then(|s| s.email.clone())
            .or_else(|| committer.and_then(|s| s.email.clone()))
            .unwrap_or_default();

        Ok(Commit {
            sha: item.sha,
            author_name,
            author_email,
            authored_at,
            committed_at,
            message: item.commit.message,
            html_url: item.html_url,
        })
    }
}
