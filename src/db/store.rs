use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::repo::{self, Pool};
use super::StoreError;
use crate::model::{LinkSnapshot, NewUser, Repository, User, WatchLink};

/// Persistence capability shared by the reconciler and the command handlers.
#[async_trait]
pub trait WatchStore: Send + Sync {
    async fn upsert_user(&self, user: &NewUser) -> Result<(User, bool), StoreError>;

    async fn set_user_token(&self, user_id: i64, token: &str) -> Result<(), StoreError>;

    async fn upsert_repository(
        &self,
        name: &str,
        full_name: &str,
    ) -> Result<(Repository, bool), StoreError>;

    async fn link_watch(
        &self,
        user_id: i64,
        repository_id: i64,
        seed: DateTime<Utc>,
    ) -> Result<(WatchLink, bool), StoreError>;

    /// Advance-only write; `Ok(false)` means the stored watermark was kept.
    async fn update_watermark(
        &self,
        link_id: i64,
        watermark: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn remove_link(&self, user_id: i64, repository_id: i64) -> Result<bool, StoreError>;

    async fn list_all_links(&self) -> Result<Vec<LinkSnapshot>, StoreError>;

    async fn list_links_for_user(&self, user_id: i64) -> Result<Vec<LinkSnapshot>, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    async fn find_user_by_chat_id(&self, chat_id: &str) -> Result<Option<User>, StoreError>;

    async fn find_repository_by_name(
        &self,
        full_name: &str,
    ) -> Result<Option<Repository>, StoreError>;

    async fn log_inbound_message(
        &self,
        chat_id: &str,
        username: Option<&str>,
        message: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl WatchStore for SqliteStore {
    async fn upsert_user(&self, user: &NewUser) -> Result<(User, bool), StoreError> {
        repo::upsert_user(&self.pool, user).await
    }

    async fn set_user_token(&self, user_id: i64, token: &str) -> Result<(), StoreError> {
        repo::set_user_token(&self.pool, user_id, token).await
    }

    async fn upsert_repository(
        &self,
        name: &str,
        full_name: &str,
    ) -> Result<(Repository, bool), StoreError> {
        repo::upsert_repository(&self.pool, name, full_name).await
    }

    async fn link_watch(
        &self,
        user_id: i64,
        repository_id: i64,
        seed: DateTime<Utc>,
    ) -> Result<(WatchLink, bool), StoreError> {
        repo::link_watch(&self.pool, user_id, repository_id, seed).await
    }

    async fn update_watermark(
        &self,
        link_id: i64,
        watermark: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        repo::update_watermark(&self.pool, link_id, watermark).await
    }

    async fn remove_link(&self, user_id: i64, repository_id: i64) -> Result<bool, StoreError> {
        repo::remove_link(&self.pool, user_id, repository_id).await
    }

    async fn list_all_links(&self) -> Result<Vec<LinkSnapshot>, StoreError> {
        repo::list_all_links(&self.pool).await
    }

    async fn list_links_for_user(&self, user_id: i64) -> Result<Vec<LinkSnapshot>, StoreError> {
        repo::list_links_for_user(&self.pool, user_id).await
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        repo::list_users(&self.pool).await
    }

    async fn find_user_by_chat_id(&self, chat_id: &str) -> Result<Option<User>, StoreError> {
        repo::find_user_by_chat_id(&self.pool, chat_id).await
    }

    async fn find_repository_by_name(
        &self,
        full_name: &str,
    ) -> Result<Option<Repository>, StoreError> {
        repo::find_repository_by_name(&self.pool, full_name).await
    }

    async fn log_inbound_message(
        &self,
        chat_id: &str,
        username: Option<&str>,
        message: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        repo::log_inbound_message(&self.pool, chat_id, username, message, sent_at)
            .await
            .map(|_| ())
    }
}
