//! Postgres-backed digest store.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DigestStore, StoreResult, StoredDigest};

/// Persist resolved digests in Postgres.
///
/// The table is an append-only log keyed by `(workflow_id, id)`; there is
/// deliberately no uniqueness constraint on `(workflow_id, reference)`.
/// The resolver never writes a reference twice within one workflow, and
/// replay reads rows in `id` order so duplicates reconstruct
/// deterministically.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_docker_digests (
    id BIGSERIAL PRIMARY KEY,
    workflow_id UUID NOT NULL,
    reference TEXT NOT NULL,
    digest TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_workflow_docker_digests_workflow
    ON workflow_docker_digests (workflow_id, id)
"#;

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the idempotent schema migration.
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DigestStore for PostgresStore {
    async fn load_all(&self, workflow_id: Uuid) -> StoreResult<Vec<StoredDigest>> {
        let rows = sqlx::query(
            "SELECT reference, digest FROM workflow_docker_digests \
             WHERE workflow_id = $1 ORDER BY id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredDigest {
                reference: row.get("reference"),
                digest: row.get("digest"),
            })
            .collect())
    }

    async fn put(&self, workflow_id: Uuid, reference: &str, digest: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workflow_docker_digests (workflow_id, reference, digest) \
             VALUES ($1, $2, $3)",
        )
        .bind(workflow_id)
        .bind(reference)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
