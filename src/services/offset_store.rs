//! Where synchronization remembers how far it got.

use crate::{db, errors::StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

/// Last offer log sequence applied to a target, per source/target/container.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn load(
        &self,
        source_offer: &str,
        target_offer: &str,
        container: &str,
    ) -> StorageResult<Option<u64>>;

    async fn save(
        &self,
        source_offer: &str,
        target_offer: &str,
        container: &str,
        offset: u64,
    ) -> StorageResult<()>;
}

#[derive(Clone)]
pub struct SqliteOffsetStore {
    db: SqlitePool,
}

impl SqliteOffsetStore {
    /// Connect to `url` (a `sqlite:` URL) and create the table if needed.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = db::open_url(url).await?;
        db::run_migrations(&db, db::SYNC_OFFSET_MIGRATIONS).await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl OffsetStore for SqliteOffsetStore {
    async fn load(
        &self,
        source_offer: &str,
        target_offer: &str,
        container: &str,
    ) -> StorageResult<Option<u64>> {
        let offset: Option<i64> = sqlx::query_scalar(
            "SELECT offset_value FROM sync_offsets
             WHERE source_offer = ? AND target_offer = ? AND container = ?",
        )
        .bind(source_offer)
        .bind(target_offer)
        .bind(container)
        .fetch_optional(&self.db)
        .await?;
        Ok(offset.map(|value| value.max(0) as u64))
    }

    async fn save(
        &self,
        source_offer: &str,
        target_offer: &str,
        container: &str,
        offset: u64,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO sync_offsets (source_offer, target_offer, container, offset_value, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(source_offer, target_offer, container) DO UPDATE SET
                offset_value = excluded.offset_value,
                updated_at = excluded.updated_at",
        )
        .bind(source_offer)
        .bind(target_offer)
        .bind(container)
        .bind(offset as i64)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        tracing::debug!(source_offer, target_offer, container, offset, "sync offset saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn offsets_are_keyed_by_source_target_and_container() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("offsets.db").display());
        let store = SqliteOffsetStore::connect(&url).await.unwrap();

        assert_eq!(store.load("a", "b", "0_unit").await.unwrap(), None);
        store.save("a", "b", "0_unit", 4).await.unwrap();
        store.save("a", "b", "0_unit", 6).await.unwrap();
        store.save("b", "a", "0_unit", 1).await.unwrap();

        assert_eq!(store.load("a", "b", "0_unit").await.unwrap(), Some(6));
        assert_eq!(store.load("b", "a", "0_unit").await.unwrap(), Some(1));
        assert_eq!(store.load("a", "b", "0_object").await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_memory_store_works() {
        let store = SqliteOffsetStore::connect("sqlite::memory:").await.unwrap();
        store.save("a", "b", "c", 3).await.unwrap();
        assert_eq!(store.load("a", "b", "c").await.unwrap(), Some(3));
    }
}
