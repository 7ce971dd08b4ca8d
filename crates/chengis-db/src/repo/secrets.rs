//! Encrypted secret rows.
//!
//! The repo stores ciphertext only; encryption and decryption happen in the
//! local secret backend (`crate::secret`). Values are never logged.

use async_trait::async_trait;
use chengis_core::ResourceId;
use sqlx::PgPool;

use crate::DbResult;

/// One encrypted secret row. `job_id` is NULL for global scope.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRow {
    pub org_id: Option<uuid::Uuid>,
    pub job_id: Option<uuid::Uuid>,
    pub key: String,
    /// Nonce-prefixed AES-256-GCM ciphertext.
    pub ciphertext: Vec<u8>,
}

#[async_trait]
pub trait SecretRepo: Send + Sync {
    async fn put(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
        key: &str,
        ciphertext: Vec<u8>,
    ) -> DbResult<()>;

    async fn delete(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
        key: &str,
    ) -> DbResult<()>;

    /// All rows in a scope.
    async fn get_scope(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
    ) -> DbResult<Vec<SecretRow>>;
}

/// PostgreSQL implementation of [`SecretRepo`].
pub struct PgSecretRepo {
    pool: PgPool,
}

impl PgSecretRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretRepo for PgSecretRepo {
    async fn put(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
        key: &str,
        ciphertext: Vec<u8>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secrets (org_id, job_id, key, ciphertext, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (COALESCE(org_id, '00000000-0000-0000-0000-000000000000'::uuid),
                         COALESCE(job_id, '00000000-0000-0000-0000-000000000000'::uuid),
                         key)
            DO UPDATE SET
                ciphertext = EXCLUDED.ciphertext,
                updated_at = NOW()
            "#,
        )
        .bind(org_id.map(|o| *o.as_uuid()))
        .bind(job_id.map(|j| *j.as_uuid()))
        .bind(key)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
        key: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            DELETE FROM secrets
            WHERE org_id IS NOT DISTINCT FROM $1
              AND job_id IS NOT DISTINCT FROM $2
              AND key = $3
            "#,
        )
        .bind(org_id.map(|o| *o.as_uuid()))
        .bind(job_id.map(|j| *j.as_uuid()))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scope(
        &self,
        org_id: Option<ResourceId>,
        job_id: Option<ResourceId>,
    ) -> DbResult<Vec<SecretRow>> {
        let rows = sqlx::query_as::<_, SecretRow>(
            r#"
            SELECT org_id, job_id, key, ciphertext FROM secrets
            WHERE org_id IS NOT DISTINCT FROM $1
              AND job_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(org_id.map(|o| *o.as_uuid()))
        .bind(job_id.map(|j| *j.as_uuid()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
