//! Row types decoded by the repository queries.
//!
//! Each entity has exactly one row struct and one conversion into the domain
//! type in `crate::model`. Watermarks are stored as unix seconds so that the
//! conditional update in `repo::update_watermark` compares integers.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::StoreError;
use crate::model::{LinkSnapshot, Repository, User, WatchLink};

#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub chat_id: String,
    pub login: String,
    pub name: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            chat_id: row.chat_id,
            login: row.login,
            name: row.name,
            token: row.token,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: row.id,
            name: row.name,
            full_name: row.full_name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct WatchLinkRow {
    pub id: i64,
    pub user_id: i64,
    pub repository_id: i64,
    pub watermark: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WatchLinkRow> for WatchLink {
    type Error = StoreError;

    fn try_from(row: WatchLinkRow) -> Result<Self, Self::Error> {
        Ok(WatchLink {
            id: row.id,
            user_id: row.user_id,
            repository_id: row.repository_id,
            watermark: from_unix(row.watermark)?,
            created_at: row.created_at,
        })
    }
}

/// Flattened join of `watch_links`, `users` and `repositories`.
#[derive(Debug, FromRow)]
pub struct LinkSnapshotRow {
    pub link_id: i64,
    pub watermark: i64,
    pub user_id: i64,
    pub chat_id: String,
    pub login: String,
    pub user_name: String,
    pub token: String,
    pub user_created_at: DateTime<Utc>,
    pub repository_id: i64,
    pub repository_name: String,
    pub full_name: String,
    pub repository_created_at: DateTime<Utc>,
}

impl TryFrom<LinkSnapshotRow> for LinkSnapshot {
    type Error = StoreError;

    fn try_from(row: LinkSnapshotRow) -> Result<Self, Self::Error> {
        Ok(LinkSnapshot {
            link_id: row.link_id,
            watermark: from_unix(row.watermark)?,
            user: User {
                id: row.user_id,
                chat_id: row.chat_id,
                login: row.login,
                name: row.user_name,
                token: row.token,
                created_at: row.user_created_at,
            },
            repository: Repository {
                id: row.repository_id,
                name: row.repository_name,
                full_name: row.full_name,
                created_at: row.repository_created_at,
            },
        })
    }
}

pub fn to_unix(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn from_unix(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("watermark {secs} out of range")))
}
