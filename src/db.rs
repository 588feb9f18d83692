//! SQLite pool setup and embedded migrations.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr};

/// Schema of an offer's metadata database.
pub const OFFER_MIGRATIONS: &str = include_str!("../migrations/0001_offer.sql");
/// Schema of the synchronization offset database.
pub const SYNC_OFFSET_MIGRATIONS: &str = include_str!("../migrations/0002_sync_offsets.sql");

/// Open (creating if needed) the SQLite database file at `path`.
pub async fn open_file(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    tracing::debug!(path = %path.display(), "opening sqlite database");
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Open a database from a `sqlite:` URL. In-memory databases get a single
/// connection so every query sees the same schema.
pub async fn open_url(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };
    tracing::debug!(url, "opening sqlite database");
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Run every `;`-separated statement of an embedded migration script.
pub async fn run_migrations(db: &SqlitePool, sql: &str) -> Result<(), sqlx::Error> {
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::debug!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::trace!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
