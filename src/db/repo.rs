use super::model::{to_unix, LinkSnapshotRow, RepositoryRow, UserRow, WatchLinkRow};
use super::StoreError;
use crate::model::{LinkSnapshot, NewUser, Repository, User, WatchLink};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

const USER_COLUMNS: &str = "id, chat_id, login, name, token, created_at";
const REPOSITORY_COLUMNS: &str = "id, name, full_name, created_at";
const LINK_COLUMNS: &str = "id, user_id, repository_id, watermark, created_at";
const SNAPSHOT_SELECT: &str = "SELECT l.id AS link_id, l.watermark, \
            u.id AS user_id, u.chat_id, u.login, u.name AS user_name, u.token, \
            u.created_at AS user_created_at, \
            r.id AS repository_id, r.name AS repository_name, r.full_name, \
            r.created_at AS repository_created_at \
     FROM watch_links l \
     JOIN users u ON u.id = l.user_id \
     JOIN repositories r ON r.id = l.repository_id";

pub async fn init_pool(database_url: &str) -> Result<Pool, StoreError> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and create the parent
/// directory. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a user keyed by chat id, or return the existing row untouched.
///
/// A row owning the same GitHub login under another chat id also counts as
/// existing; callers compare `chat_id` to detect that case.
#[instrument(skip_all)]
pub async fn upsert_user(pool: &Pool, new: &NewUser) -> Result<(User, bool), StoreError> {
    let sql = format!(
        "INSERT INTO users (chat_id, login, name, token) VALUES (?, ?, ?, ?) \
         ON CONFLICT DO NOTHING RETURNING {USER_COLUMNS}"
    );
    let inserted = sqlx::query_as::<_, UserRow>(&sql)
        .bind(&new.chat_id)
        .bind(&new.login)
        .bind(&new.name)
        .bind(&new.token)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = inserted {
        debug!(login = %new.login, "registered user");
        return Ok((row.into(), true));
    }

    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users WHERE chat_id = ? OR login = ? \
         ORDER BY (chat_id = ?) DESC LIMIT 1"
    );
    let existing = sqlx::query_as::<_, UserRow>(&sql)
        .bind(&new.chat_id)
        .bind(&new.login)
        .bind(&new.chat_id)
        .fetch_one(pool)
        .await?;
    Ok((existing.into(), false))
}

/// Replace a user's access token after a repeated handshake.
#[instrument(skip_all)]
pub async fn set_user_token(pool: &Pool, user_id: i64, token: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE users SET token = ? WHERE id = ?")
        .bind(token)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn find_user_by_chat_id(pool: &Pool, chat_id: &str) -> Result<Option<User>, StoreError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE chat_id = ?");
    let row = sqlx::query_as::<_, UserRow>(&sql)
        .bind(chat_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(User::from))
}

#[instrument(skip_all)]
pub async fn list_users(pool: &Pool) -> Result<Vec<User>, StoreError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY id");
    let rows = sqlx::query_as::<_, UserRow>(&sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(User::from).collect())
}

/// Insert a repository keyed by full name, or return the existing row.
#[instrument(skip_all)]
pub async fn upsert_repository(
    pool: &Pool,
    name: &str,
    full_name: &str,
) -> Result<(Repository, bool), StoreError> {
    let sql = format!(
        "INSERT INTO repositories (name, full_name) VALUES (?, ?) \
         ON CONFLICT(full_name) DO NOTHING RETURNING {REPOSITORY_COLUMNS}"
    );
    let inserted = sqlx::query_as::<_, RepositoryRow>(&sql)
        .bind(name)
        .bind(full_name)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = inserted {
        return Ok((row.into(), true));
    }

    let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE full_name = ?");
    let existing = sqlx::query_as::<_, RepositoryRow>(&sql)
        .bind(full_name)
        .fetch_one(pool)
        .await?;
    Ok((existing.into(), false))
}

#[instrument(skip_all)]
pub async fn find_repository_by_name(
    pool: &Pool,
    full_name: &str,
) -> Result<Option<Repository>, StoreError> {
    let sql = format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE full_name = ?");
    let row = sqlx::query_as::<_, RepositoryRow>(&sql)
        .bind(full_name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Repository::from))
}

/// Create the (user, repository) link seeded with `seed`, or return the
/// existing link with its stored watermark.
#[instrument(skip_all)]
pub async fn link_watch(
    pool: &Pool,
    user_id: i64,
    repository_id: i64,
    seed: DateTime<Utc>,
) -> Result<(WatchLink, bool), StoreError> {
    let sql = format!(
        "INSERT INTO watch_links (user_id, repository_id, watermark) VALUES (?, ?, ?) \
         ON CONFLICT(user_id, repository_id) DO NOTHING RETURNING {LINK_COLUMNS}"
    );
    let inserted = sqlx::query_as::<_, WatchLinkRow>(&sql)
        .bind(user_id)
        .bind(repository_id)
        .bind(to_unix(seed))
        .fetch_optional(pool)
        .await?;
    if let Some(row) = inserted {
        return Ok((row.try_into()?, true));
    }

    match find_link(pool, user_id, repository_id).await? {
        Some(link) => Ok((link, false)),
        // Removed between the insert and the lookup; the next call recreates it.
        None => Err(StoreError::Corrupt(format!(
            "watch link ({user_id}, {repository_id}) vanished during upsert"
        ))),
    }
}

#[instrument(skip_all)]
pub async fn find_link(
    pool: &Pool,
    user_id: i64,
    repository_id: i64,
) -> Result<Option<WatchLink>, StoreError> {
    let sql =
        format!("SELECT {LINK_COLUMNS} FROM watch_links WHERE user_id = ? AND repository_id = ?");
    let row = sqlx::query_as::<_, WatchLinkRow>(&sql)
        .bind(user_id)
        .bind(repository_id)
        .fetch_optional(pool)
        .await?;
    row.map(WatchLink::try_from).transpose()
}

/// Move a link's watermark forward to `watermark`.
///
/// Returns `false` when the stored value is already at or past `watermark`
/// (or the link is gone); the stored value never moves backward.
#[instrument(skip_all, fields(link_id = link_id))]
pub async fn update_watermark(
    pool: &Pool,
    link_id: i64,
    watermark: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let res = sqlx::query("UPDATE watch_links SET watermark = ?1 WHERE id = ?2 AND watermark < ?1")
        .bind(to_unix(watermark))
        .bind(link_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Delete the (user, repository) link. Missing links are not an error.
#[instrument(skip_all)]
pub async fn remove_link(pool: &Pool, user_id: i64, repository_id: i64) -> Result<bool, StoreError> {
    let res = sqlx::query("DELETE FROM watch_links WHERE user_id = ? AND repository_id = ?")
        .bind(user_id)
        .bind(repository_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn list_all_links(pool: &Pool) -> Result<Vec<LinkSnapshot>, StoreError> {
    let sql = format!("{SNAPSHOT_SELECT} ORDER BY l.id");
    let rows = sqlx::query_as::<_, LinkSnapshotRow>(&sql)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(LinkSnapshot::try_from).collect()
}

#[instrument(skip_all)]
pub async fn list_links_for_user(pool: &Pool, user_id: i64) -> Result<Vec<LinkSnapshot>, StoreError> {
    let sql = format!("{SNAPSHOT_SELECT} WHERE l.user_id = ? ORDER BY r.full_name");
    let rows = sqlx::query_as::<_, LinkSnapshotRow>(&sql)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(LinkSnapshot::try_from).collect()
}

/// Append an inbound chat message to the audit log.
#[instrument(skip_all)]
pub async fn log_inbound_message(
    pool: &Pool,
    chat_id: &str,
    username: Option<&str>,
    message: &str,
    sent_at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO telegram_messages (chat_id, username, message, sent_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(chat_id)
    .bind(username)
    .bind(message)
    .bind(sent_at)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn new_user(chat_id: &str, login: &str) -> NewUser {
        NewUser {
            chat_id: chat_id.into(),
            login: login.into(),
            name: login.to_uppercase(),
            token: format!("token-{login}"),
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x/y"), "postgres://x/y");
        let td = tempfile::tempdir().unwrap();
        let file = td.path().join("nested").join("ghwatch.db");
        let url = format!("sqlite://{}?mode=rwc", file.display());
        assert_eq!(prepare_sqlite_url(&url), url);
        assert!(file.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn upsert_user_keeps_existing_row() {
        let pool = setup_pool().await;
        let (first, created) = upsert_user(&pool, &new_user("1", "alice")).await.unwrap();
        assert!(created);

        let mut again = new_user("1", "alice");
        again.token = "rotated".into();
        let (second, created) = upsert_user(&pool, &again).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.token, "token-alice");

        set_user_token(&pool, first.id, "rotated").await.unwrap();
        let stored = find_user_by_chat_id(&pool, "1").await.unwrap().unwrap();
        assert_eq!(stored.token, "rotated");
    }

    #[tokio::test]
    async fn upsert_user_reports_login_owned_by_other_chat() {
        let pool = setup_pool().await;
        upsert_user(&pool, &new_user("1", "alice")).await.unwrap();
        let (existing, created) = upsert_user(&pool, &new_user("2", "alice")).await.unwrap();
        assert!(!created);
        assert_eq!(existing.chat_id, "1");
        assert!(find_user_by_chat_id(&pool, "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_inbound_message_appends() {
        let pool = setup_pool().await;
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let a = log_inbound_message(&pool, "1", Some("alice"), "/help", at).await.unwrap();
        let b = log_inbound_message(&pool, "1", None, "/me", at).await.unwrap();
        assert!(b > a);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM telegram_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
