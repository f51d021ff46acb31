//! Reconciliation cycles.
//!
//! Discovery walks every registered user and records the repositories they
//! watch on GitHub. The commit check walks every watch link, relays commits
//! newer than the link's watermark and moves the watermark forward. Both fan
//! out one task per unit of work; a failing unit never affects its siblings.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::db::{StoreError, WatchStore};
use crate::github::{GithubError, GithubService};
use crate::model::{Commit, LinkSnapshot, RemoteRepository, User};
use crate::notifier::{commit_message, repository_removed_message, Notifier};

/// Result of one commit check for one watch link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// New commits were relayed. `advanced` is false when a concurrent run
    /// already stored an equal or later watermark.
    Processed {
        commits: usize,
        notified: usize,
        advanced: bool,
    },
    /// Nothing new since the watermark.
    Unchanged,
    /// The repository is gone and the link was deleted.
    Removed,
    /// Transient failure; retried next cycle with the watermark untouched.
    Failed,
    /// Permanently unusable link data (malformed chat id).
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub links: usize,
    pub processed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub notified: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &LinkOutcome) {
        match outcome {
            LinkOutcome::Processed { notified, .. } => {
                self.processed += 1;
                self.notified += notified;
            }
            LinkOutcome::Unchanged => self.unchanged += 1,
            LinkOutcome::Removed => self.removed += 1,
            LinkOutcome::Failed => self.failed += 1,
            LinkOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Repositories recorded for one user during discovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserDiscovery {
    pub repositories: usize,
    pub new_links: usize,
    /// Repositories whose store writes failed.
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub users: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub new_links: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn WatchStore>,
    github: Arc<dyn GithubService>,
    notifier: Arc<dyn Notifier>,
    limit: Arc<Semaphore>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn WatchStore>,
        github: Arc<dyn GithubService>,
        notifier: Arc<dyn Notifier>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            github,
            notifier,
            limit: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Cycle B: check every watch link for new commits.
    pub async fn check_commits(&self) -> CycleReport {
        let cycle_id = Uuid::new_v4();
        self.run_commit_cycle()
            .instrument(info_span!("check_commits", %cycle_id))
            .await
    }

    async fn run_commit_cycle(&self) -> CycleReport {
        let links = match self.store.list_all_links().await {
            Ok(links) => links,
            Err(err) => {
                error!(?err, "failed to load watch links; skipping cycle");
                return CycleReport::default();
            }
        };
        let mut report = CycleReport {
            links: links.len(),
            ..CycleReport::default()
        };

        let mut tasks = JoinSet::new();
        for link in links {
            let this = self.clone();
            tasks.spawn(
                async move {
                    let Ok(_permit) = this.limit.clone().acquire_owned().await else {
                        return LinkOutcome::Failed;
                    };
                    this.check_link(&link).await
                }
                .in_current_span(),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    error!(?err, "commit check task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            links = report.links,
            processed = report.processed,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            skipped = report.skipped,
            notified = report.notified,
            "commit check finished"
        );
        report
    }

    /// One unit of work of the commit check.
    #[instrument(skip_all, fields(link_id = link.link_id, repo = %link.repository.full_name))]
    pub async fn check_link(&self, link: &LinkSnapshot) -> LinkOutcome {
        let chat_id = match link.user.chat_id.trim().parse::<i64>() {
            Ok(id) => id,
            Err(_) => {
                warn!(chat_id = %link.user.chat_id, "malformed chat id; skipping link");
                return LinkOutcome::Skipped;
            }
        };

        // The boundary commit was already relayed.
        let since = link.watermark + Duration::seconds(1);
        let commits = match self
            .github
            .fetch_commits_since(&link.user.token, &link.repository.full_name, since)
            .await
        {
            Ok(commits) => commits,
            Err(GithubError::NotFound) => return self.remove_missing(link, chat_id).await,
            Err(err) => {
                warn!(?err, "failed to fetch commits");
                return LinkOutcome::Failed;
            }
        };
        if commits.is_empty() {
            debug!("no new commits");
            return LinkOutcome::Unchanged;
        }

        let candidate = commits
            .iter()
            .map(Commit::observed_at)
            .max()
            .unwrap_or(link.watermark);
        let markup = self.notifier.supports_markup();
        let mut notified = 0;
        for commit in &commits {
            let text = commit_message(&link.repository.full_name, commit, markup);
            match self.notifier.notify(chat_id, &text).await {
                Ok(()) => notified += 1,
                Err(err) => warn!(?err, sha = %commit.short_sha(), "failed to send commit notification"),
            }
        }

        let advanced = match self.store.update_watermark(link.link_id, candidate).await {
            Ok(advanced) => advanced,
            Err(err) => {
                error!(?err, watermark = %candidate, "failed to store watermark");
                return LinkOutcome::Failed;
            }
        };
        if !advanced {
            debug!(watermark = %candidate, "stored watermark already at or past candidate");
        }
        LinkOutcome::Processed {
            commits: commits.len(),
            notified,
            advanced,
        }
    }

    async fn remove_missing(&self, link: &LinkSnapshot, chat_id: i64) -> LinkOutcome {
        let removed = match self
            .store
            .remove_link(link.user.id, link.repository.id)
            .await
        {
            Ok(removed) => removed,
            Err(err) => {
                error!(?err, "failed to remove link to missing repository");
                return LinkOutcome::Failed;
            }
        };
        // An overlapping run already removed it and told the user.
        if !removed {
            debug!("link already removed");
            return LinkOutcome::Unchanged;
        }

        info!("repository not found; link removed");
        let text =
            repository_removed_message(&link.repository.full_name, self.notifier.supports_markup());
        if let Err(err) = self.notifier.notify(chat_id, &text).await {
            warn!(?err, "failed to send removal notification");
        }
        LinkOutcome::Removed
    }

    /// Cycle A: record the repositories each user watches on GitHub.
    pub async fn discover_repositories(&self) -> DiscoveryReport {
        let cycle_id = Uuid::new_v4();
        self.run_discovery_cycle()
            .instrument(info_span!("discover_repositories", %cycle_id))
            .await
    }

    async fn run_discovery_cycle(&self) -> DiscoveryReport {
        let users = match self.store.list_users().await {
            Ok(users) => users,
            Err(err) => {
                error!(?err, "failed to load users; skipping cycle");
                return DiscoveryReport::default();
            }
        };
        let mut report = DiscoveryReport {
            users: users.len(),
            ..DiscoveryReport::default()
        };

        let mut tasks = JoinSet::new();
        for user in users {
            let this = self.clone();
            tasks.spawn(
                async move {
                    let Ok(_permit) = this.limit.clone().acquire_owned().await else {
                        return None;
                    };
                    match this.discover_for_user(&user).await {
                        Ok(found) => Some(found),
                        Err(err) => {
                            warn!(?err, user_id = user.id, "failed to fetch watched repositories");
                            None
                        }
                    }
                }
                .in_current_span(),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(found)) => {
                    report.succeeded += 1;
                    report.new_links += found.new_links;
                }
                Ok(None) => report.failed += 1,
                Err(err) => {
                    error!(?err, "discovery task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            users = report.users,
            succeeded = report.succeeded,
            failed = report.failed,
            new_links = report.new_links,
            "discovery finished"
        );
        report
    }

    /// Link every repository `user` watches on GitHub, seeding new links
    /// with the repository's last update time.
    #[instrument(skip_all, fields(user_id = user.id))]
    pub async fn discover_for_user(&self, user: &User) -> Result<UserDiscovery, GithubError> {
        let remote = self
            .github
            .fetch_watched_repositories(&user.token, &user.login)
            .await?;
        let mut found = UserDiscovery {
            repositories: remote.len(),
            ..UserDiscovery::default()
        };
        for repo in &remote {
            match self.link_remote(user.id, repo).await {
                Ok(true) => found.new_links += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, repo = %repo.full_name, "failed to record watched repository");
                    found.failed += 1;
                }
            }
        }
        debug!(
            repositories = found.repositories,
            new_links = found.new_links,
            "user discovery done"
        );
        Ok(found)
    }

    async fn link_remote(&self, user_id: i64, repo: &RemoteRepository) -> Result<bool, StoreError> {
        let (repository, _) = self
            .store
            .upsert_repository(&repo.name, &repo.full_name)
            .await?;
        let (_, created) = self
            .store
            .link_watch(user_id, repository.id, repo.updated_at)
            .await?;
        Ok(created)
    }
}
