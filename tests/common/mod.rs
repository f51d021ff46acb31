#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use gh_watchbot::db::{self, SqliteStore, WatchStore};
use gh_watchbot::github::{GithubError, GithubService};
use gh_watchbot::model::{Commit, Identity, LinkSnapshot, NewUser, RemoteRepository, User};
use gh_watchbot::notifier::{Notifier, SendError};
use gh_watchbot::reconcile::Reconciler;

pub const AUTHORIZE_URL: &str =
    "https://github.com/login/oauth/authorize?client_id=cid&scope=repo";

pub async fn setup_store() -> SqliteStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::run_migrations(&pool).await.unwrap();
    SqliteStore::new(pool)
}

/// Fixed base instant plus `secs` seconds.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

pub fn commit(sha: &str, authored: i64, committed: i64) -> Commit {
    Commit {
        sha: sha.to_string(),
        author_name: "Ann".into(),
        author_email: "ann@example.com".into(),
        authored_at: ts(authored),
        committed_at: ts(committed),
        message: format!("change {sha}"),
        html_url: None,
    }
}

pub fn remote(full_name: &str, updated: i64) -> RemoteRepository {
    let name = full_name.split('/').nth(1).unwrap_or(full_name).to_string();
    RemoteRepository {
        name,
        full_name: full_name.to_string(),
        updated_at: ts(updated),
    }
}

pub async fn add_user(store: &SqliteStore, chat_id: &str, login: &str) -> User {
    let (user, _) = store
        .upsert_user(&NewUser {
            chat_id: chat_id.to_string(),
            login: login.to_string(),
            name: login.to_uppercase(),
            token: format!("token-{login}"),
        })
        .await
        .unwrap();
    user
}

/// Watch `full_name` for `user` with the given watermark; returns the link id.
pub async fn add_link(store: &SqliteStore, user: &User, full_name: &str, watermark: i64) -> i64 {
    let name = full_name.split('/').nth(1).unwrap_or(full_name);
    let (repo, _) = store.upsert_repository(name, full_name).await.unwrap();
    let (link, _) = store
        .link_watch(user.id, repo.id, ts(watermark))
        .await
        .unwrap();
    link.id
}

pub async fn snapshot(store: &SqliteStore, link_id: i64) -> Option<LinkSnapshot> {
    store
        .list_all_links()
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.link_id == link_id)
}

pub async fn watermark(store: &SqliteStore, link_id: i64) -> DateTime<Utc> {
    snapshot(store, link_id).await.unwrap().watermark
}

type Scripted<T> = Mutex<HashMap<String, VecDeque<Result<T, GithubError>>>>;

/// Scripted platform client. Unscripted commit and subscription fetches
/// succeed with an empty list.
#[derive(Default)]
pub struct FakeGithub {
    commits: Scripted<Vec<Commit>>,
    watched: Scripted<Vec<RemoteRepository>>,
    identities: Mutex<HashMap<String, Identity>>,
    repositories: Mutex<HashMap<String, RemoteRepository>>,
    exchanges: Mutex<VecDeque<Result<String, GithubError>>>,
    pub calls: Mutex<Vec<String>>,
    pub commit_requests: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl FakeGithub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push_commits(&self, full_name: &str, result: Result<Vec<Commit>, GithubError>) {
        self.commits
            .lock()
            .await
            .entry(full_name.to_string())
            .or_default()
            .push_back(result);
    }

    pub async fn push_watched(
        &self,
        login: &str,
        result: Result<Vec<RemoteRepository>, GithubError>,
    ) {
        self.watched
            .lock()
            .await
            .entry(login.to_string())
            .or_default()
            .push_back(result);
    }

    pub async fn add_identity(&self, token: &str, login: &str, name: &str) {
        self.identities.lock().await.insert(
            token.to_string(),
            Identity {
                name: name.to_string(),
                login: login.to_string(),
            },
        );
    }

    pub async fn add_repository(&self, repo: RemoteRepository) {
        self.repositories
            .lock()
            .await
            .insert(repo.full_name.to_lowercase(), repo);
    }

    pub async fn push_exchange(&self, result: Result<String, GithubError>) {
        self.exchanges.lock().await.push_back(result);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl GithubService for FakeGithub {
    fn authorize_url(&self) -> String {
        AUTHORIZE_URL.to_string()
    }

    async fn exchange_code_for_token(&self, code: &str) -> Result<String, GithubError> {
        self.record(format!("exchange {code}")).await;
        self.exchanges
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(GithubError::Auth("unscripted exchange".into())))
    }

    async fn fetch_identity(&self, token: &str) -> Result<Identity, GithubError> {
        self.record(format!("identity {token}")).await;
        self.identities
            .lock()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| GithubError::Auth("Bad credentials".into()))
    }

    async fn fetch_watched_repositories(
        &self,
        _token: &str,
        login: &str,
    ) -> Result<Vec<RemoteRepository>, GithubError> {
        self.record(format!("watched {login}")).await;
        self.watched
            .lock()
            .await
            .get_mut(login)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn fetch_repository(
        &self,
        _token: &str,
        full_name: &str,
    ) -> Result<RemoteRepository, GithubError> {
        self.record(format!("repository {full_name}")).await;
        self.repositories
            .lock()
            .await
            .get(&full_name.to_lowercase())
            .cloned()
            .ok_or(GithubError::NotFound)
    }

    async fn fetch_commits_since(
        &self,
        _token: &str,
        full_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Commit>, GithubError> {
        self.record(format!("commits {full_name}")).await;
        self.commit_requests
            .lock()
            .await
            .push((full_name.to_string(), since));
        self.commits
            .lock()
            .await
            .get_mut(full_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Records every message; fails every send while `failing` is set.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(i64, String)>>,
    pub failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        if *self.failing.lock().await {
            return Err(SendError::Other("chat unavailable".into()));
        }
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}

pub fn reconciler(
    store: &SqliteStore,
    github: &Arc<FakeGithub>,
    notifier: &Arc<RecordingNotifier>,
) -> Reconciler {
    Reconciler::new(
        Arc::new(store.clone()),
        github.clone(),
        notifier.clone(),
        4,
    )
}
