use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Github as GithubConfig;
use crate::github::model::{AccessTokenResp, CommitItem, RepoResp, UserResp};
use crate::model::{Commit, Identity, RemoteRepository};

pub mod model;

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;
const BODY_SNIPPET: usize = 300;

#[derive(Debug, Error)]
pub enum GithubError {
    /// Token exchange or identity lookup rejected.
    #[error("authorization failed: {0}")]
    Auth(String),
    /// Repository deleted, renamed or no longer visible to the token.
    #[error("not found")]
    NotFound,
    #[error("rate limited by GitHub")]
    RateLimited,
    #[error("GitHub returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request to GitHub failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected GitHub response: {0}")]
    Malformed(String),
}

impl GithubError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GithubError::NotFound)
    }
}

/// The platform operations the reconciler and the command handlers need.
#[async_trait]
pub trait GithubService: Send + Sync {
    /// Browser URL that starts the OAuth handshake.
    fn authorize_url(&self) -> String;

    async fn exchange_code_for_token(&self, code: &str) -> Result<String, GithubError>;

    async fn fetch_identity(&self, token: &str) -> Result<Identity, GithubError>;

    async fn fetch_watched_repositories(
        &self,
        token: &str,
        login: &str,
    ) -> Result<Vec<RemoteRepository>, GithubError>;

    async fn fetch_repository(
        &self,
        token: &str,
        full_name: &str,
    ) -> Result<RemoteRepository, GithubError>;

    /// Commits newer than `since`, oldest first.
    async fn fetch_commits_since(
        &self,
        token: &str,
        full_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Commit>, GithubError>;
}

#[derive(Clone)]
pub struct GithubClient {
    http: Client,
    api_base: Url,
    oauth_base: Url,
    authorize_url: Url,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubClient")
            .field("api_base", &self.api_base)
            .field("oauth_base", &self.oauth_base)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    pub fn from_config(cfg: &GithubConfig) -> Result<Self, GithubError> {
        let http = Client::builder()
            .user_agent(concat!("gh-watchbot/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        let api_base = parse_base(&cfg.api_base)?;
        let oauth_base = parse_base(&cfg.oauth_base)?;

        let mut authorize_url = oauth_base
            .join("login/oauth/authorize")
            .map_err(|e| GithubError::Malformed(format!("authorize url: {e}")))?;
        authorize_url
            .query_pairs_mut()
            .append_pair("client_id", &cfg.client_id)
            .append_pair("redirect_uri", &cfg.redirect_uri)
            .append_pair("scope", &cfg.scopes.join(" "));

        Ok(Self {
            http,
            api_base,
            oauth_base,
            authorize_url,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GithubError> {
        self.api_base
            .join(path)
            .map_err(|e| GithubError::Malformed(format!("invalid path {path}: {e}")))
    }

    async fn get(
        &self,
        token: &str,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<Response, GithubError> {
        debug!(url = %url, "github request");
        let res = self
            .http
            .get(url)
            .bearer_auth(token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .query(query)
            .send()
            .await?;
        Ok(res)
    }

    /// Follow `page=N` until a short page or `MAX_PAGES`.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        token: &str,
        url: Url,
        query: &[(&str, String)],
        allow_conflict: bool,
    ) -> Result<Vec<T>, GithubError> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut q = query.to_vec();
            q.push(("per_page", PER_PAGE.to_string()));
            q.push(("page", page.to_string()));
            let res = self.get(token, url.clone(), &q).await?;
            // An empty repository answers 409 on the commits listing.
            if allow_conflict && res.status() == StatusCode::CONFLICT {
                debug!(url = %url, "empty repository");
                break;
            }
            let batch: Vec<T> = decode(res).await?;
            let short = batch.len() < PER_PAGE;
            items.extend(batch);
            if short {
                break;
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl GithubService for GithubClient {
    fn authorize_url(&self) -> String {
        self.authorize_url.to_string()
    }

    #[instrument(skip_all)]
    async fn exchange_code_for_token(&self, code: &str) -> Result<String, GithubError> {
        let url = self
            .oauth_base
            .join("login/oauth/access_token")
            .map_err(|e| GithubError::Malformed(format!("token url: {e}")))?;
        let res = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await?;
        let payload: AccessTokenResp = decode(res).await.map_err(|err| match err {
            GithubError::Status { status, body } => {
                GithubError::Auth(format!("token endpoint returned {status}: {body}"))
            }
            other => other,
        })?;

        if let Some(error) = payload.error {
            return Err(GithubError::Auth(
                payload.error_description.unwrap_or(error),
            ));
        }
        match payload.access_token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(GithubError::Auth("no access token in response".into())),
        }
    }

    #[instrument(skip_all)]
    async fn fetch_identity(&self, token: &str) -> Result<Identity, GithubError> {
        let url = self.endpoint("user")?;
        let res = self.get(token, url, &[]).await?;
        let user: UserResp = decode(res).await?;
        Ok(user.into())
    }

    #[instrument(skip_all, fields(login = %login))]
    async fn fetch_watched_repositories(
        &self,
        token: &str,
        login: &str,
    ) -> Result<Vec<RemoteRepository>, GithubError> {
        let url = self.endpoint(&format!("users/{login}/subscriptions"))?;
        let repos: Vec<RepoResp> = self.get_paginated(token, url, &[], false).await?;
        Ok(repos.into_iter().map(RemoteRepository::from).collect())
    }

    #[instrument(skip_all, fields(repo = %full_name))]
    async fn fetch_repository(
        &self,
        token: &str,
        full_name: &str,
    ) -> Result<RemoteRepository, GithubError> {
        let url = self.endpoint(&format!("repos/{full_name}"))?;
        let res = self.get(token, url, &[]).await?;
        let repo: RepoResp = decode(res).await?;
        Ok(repo.into())
    }

    #[instrument(skip_all, fields(repo = %full_name))]
    async fn fetch_commits_since(
        &self,
        token: &str,
        full_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Commit>, GithubError> {
        let url = self.endpoint(&format!("repos/{full_name}/commits"))?;
        let query = [("since", since.to_rfc3339_opts(SecondsFormat::Secs, true))];
        let items: Vec<CommitItem> = self.get_paginated(token, url, &query, true).await?;

        let mut commits: Vec<Commit> = items
            .into_iter()
            .filter_map(|item| match Commit::try_from(item) {
                Ok(commit) => Some(commit),
                Err(err) => {
                    warn!(?err, repo = %full_name, "skipping undecodable commit");
                    None
                }
            })
            .collect();
        // The API lists newest first.
        commits.reverse();
        Ok(commits)
    }
}

fn parse_base(raw: &str) -> Result<Url, GithubError> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| GithubError::Malformed(format!("invalid base url {raw}: {e}")))
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, GithubError> {
    let res = check_status(res).await?;
    let body = res.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| GithubError::Malformed(format!("{e}: {}", snippet(&body))))
}

async fn check_status(res: Response) -> Result<Response, GithubError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let exhausted = res
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    let body = res.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => GithubError::NotFound,
        StatusCode::UNAUTHORIZED => GithubError::Auth(snippet(&body)),
        StatusCode::TOO_MANY_REQUESTS => GithubError::RateLimited,
        StatusCode::FORBIDDEN if exhausted => GithubError::RateLimited,
        _ => GithubError::Status {
            status: status.as_u16(),
            body: snippet(&body),
        },
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(BODY_SNIPPET).collect()
}
