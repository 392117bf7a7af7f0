//! PostgreSQL implementation of the library [`Store`].
//!
//! Every entity kind shares one `items` table; documents are kept whole as
//! JSONB and typed by the `Library` layer above.

use anyhow::Context;
use async_trait::async_trait;
use gateway_core::model::EntityKind;
use gateway_core::store::{Store, StoreError};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `items` table if it doesn't exist yet.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                kind       TEXT NOT NULL,
                id         UUID NOT NULL,
                body       JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (kind, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create items table")?;

        info!("items table ready");
        Ok(())
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").field("pool_size", &self.pool.size()).finish()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<Value>, StoreError> {
        let body = sqlx::query_scalar::<_, Value>("SELECT body FROM items WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("SELECT failed")?;
        Ok(body)
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Value>, StoreError> {
        let bodies = sqlx::query_scalar::<_, Value>("SELECT body FROM items WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .context("LIST query failed")?;
        Ok(bodies)
    }

    async fn save(&self, kind: EntityKind, id: Uuid, body: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO items (kind, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, id) DO UPDATE
            SET body       = EXCLUDED.body,
                updated_at = NOW()
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await
        .context("UPSERT failed")?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM items WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("DELETE failed")?
            .rows_affected();
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Runs against `GATEWAY_TEST_DATABASE_URL` when it is set.
    async fn store() -> Option<PgStore> {
        let url = std::env::var("GATEWAY_TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url, 2).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let Some(store) = store().await else { return };
        let id = Uuid::new_v4();
        let body = json!({"id": id, "name": "web-load", "groups": []});

        store.save(EntityKind::Graph, id, body.clone()).await.unwrap();
        assert_eq!(store.get(EntityKind::Graph, id).await.unwrap(), Some(body));
        assert_eq!(store.get(EntityKind::Collection, id).await.unwrap(), None);

        let updated = json!({"id": id, "name": "web-load-2", "groups": []});
        store.save(EntityKind::Graph, id, updated.clone()).await.unwrap();
        assert!(store.list(EntityKind::Graph).await.unwrap().contains(&updated));

        assert!(store.delete(EntityKind::Graph, id).await.unwrap());
        assert!(!store.delete(EntityKind::Graph, id).await.unwrap());
    }
}
