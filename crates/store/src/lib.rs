//! SQLite persistence for the transaction ledger and run checkpoints.

pub mod checkpoint;
pub mod ledger;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use common::Result;

pub use checkpoint::CheckpointStore;
pub use ledger::Ledger;

/// Connect to `database_url`, creating the file if needed, and run migrations.
///
/// In-memory databases are pinned to a single connection that never idles
/// out, since every new connection would see an empty database.
pub async fn open(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let in_memory = database_url.contains(":memory:");

    let mut pool_options = SqlitePoolOptions::new();
    pool_options = if in_memory {
        pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        pool_options.max_connections(4)
    };

    let pool = pool_options.connect_with(options).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!(in_memory, "Database ready");
    Ok(pool)
}

/// Fresh migrated in-memory database, for tests and dry runs.
pub async fn open_in_memory() -> Result<SqlitePool> {
    open("sqlite::memory:").await
}

fn persistence(context: &'static str) -> impl FnOnce(sqlx::Error) -> common::Error {
    move |e| common::Error::Persistence(format!("{context}: {e}"))
}
