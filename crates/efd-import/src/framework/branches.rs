//! Branch identities resolved during parsing

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ImportResult;
use crate::ledger::BranchSpec;

#[async_trait]
pub trait BranchDirectory: Send + Sync {
    /// Every known branch of the company as `(document, id)`
    async fn load_all(&self, company_id: Uuid) -> ImportResult<Vec<(String, Uuid)>>;

    /// Create the branch if needed, refresh whichever descriptive fields are
    /// given, and return its identity
    async fn ensure_branch(&self, company_id: Uuid, spec: &BranchSpec) -> ImportResult<Uuid>;
}

pub struct PgBranchDirectory {
    pool: PgPool,
}

impl PgBranchDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BranchDirectory for PgBranchDirectory {
    async fn load_all(&self, company_id: Uuid) -> ImportResult<Vec<(String, Uuid)>> {
        let rows = sqlx::query_as::<_, (String, Uuid)>(
            "SELECT document, id FROM branches WHERE company_id = $1",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn ensure_branch(&self, company_id: Uuid, spec: &BranchSpec) -> ImportResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO branches (id, company_id, document, external_code, name, state, city_code)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (company_id, document)
            DO UPDATE SET
                external_code = COALESCE(EXCLUDED.external_code, branches.external_code),
                name = COALESCE(EXCLUDED.name, branches.name),
                state = COALESCE(EXCLUDED.state, branches.state),
                city_code = COALESCE(EXCLUDED.city_code, branches.city_code),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(&spec.document)
        .bind(&spec.external_code)
        .bind(&spec.name)
        .bind(&spec.state)
        .bind(&spec.city_code)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}
