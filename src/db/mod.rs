//! Watch store: users, repositories and the watch links between them.
//!
//! - `model`: row structs and their conversions into domain types.
//! - `repo`: SQL-only functions over a SQLite pool.
//! - `store`: the `WatchStore` capability consumed by the reconciler and the
//!   command handlers, with `SqliteStore` delegating to `repo`.

use thiserror::Error;

pub mod model;
pub mod repo;
mod store;

pub use repo::*;
pub use store::{SqliteStore, WatchStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
