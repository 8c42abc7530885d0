//! Destination stores for decoded rows

use std::ops::Range;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WriteError;
use crate::ledger::{CounterpartyRow, Destination, Family, LedgerRecord};

/// Postgres `invalid_column_reference`: no unique index matches ON CONFLICT
const MISSING_CONSTRAINT: &str = "42P10";

/// Postgres `unique_violation`
const UNIQUE_VIOLATION: &str = "23505";

/// Ownership stamped on every written row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteScope {
    pub company_id: Uuid,
    pub job_id: Uuid,
}

/// A homogeneous batch bound for one destination
#[derive(Debug, Clone, Copy)]
pub enum RowBatch<'a> {
    Counterparties(&'a [CounterpartyRow]),
    Ledger(Family, &'a [LedgerRecord]),
}

impl<'a> RowBatch<'a> {
    pub fn destination(&self) -> Destination {
        match self {
            RowBatch::Counterparties(_) => Destination::Counterparties,
            RowBatch::Ledger(family, _) => Destination::Ledger(*family),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RowBatch::Counterparties(rows) => rows.len(),
            RowBatch::Ledger(_, rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice(&self, range: Range<usize>) -> RowBatch<'a> {
        match *self {
            RowBatch::Counterparties(rows) => RowBatch::Counterparties(&rows[range]),
            RowBatch::Ledger(family, rows) => RowBatch::Ledger(family, &rows[range]),
        }
    }
}

/// Writes batches into their destination store.
///
/// `upsert` must be idempotent on the destination's natural key and report
/// [`WriteError::MissingConstraint`] when the destination has none; `insert`
/// is the best-effort fallback for such destinations. Both return the number
/// of rows written.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(&self, scope: &WriteScope, batch: RowBatch<'_>) -> Result<u64, WriteError>;

    async fn insert(&self, scope: &WriteScope, batch: RowBatch<'_>) -> Result<u64, WriteError>;
}

pub struct PgRecordSink {
    pool: PgPool,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn sql_state(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

/// `INSERT INTO ... VALUES ...` for the whole batch, without a conflict
/// clause; `None` for an empty batch, which has no valid statement
fn insert_values<'a>(
    scope: &WriteScope,
    batch: RowBatch<'a>,
) -> Option<QueryBuilder<'a, Postgres>> {
    if batch.is_empty() {
        return None;
    }

    let company_id = scope.company_id;
    let job_id = scope.job_id;

    let query_builder = match batch {
        RowBatch::Counterparties(rows) => {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
                r#"
                INSERT INTO counterparties (
                    company_id,
                    job_id,
                    code,
                    name,
                    document,
                    state_registration,
                    city_code
                )
                "#,
            );
            query_builder.push_values(rows, |mut b, row| {
                b.push_bind(company_id)
                    .push_bind(job_id)
                    .push_bind(&row.code)
                    .push_bind(&row.name)
                    .push_bind(&row.document)
                    .push_bind(&row.state_registration)
                    .push_bind(&row.city_code);
            });
            query_builder
        },
        RowBatch::Ledger(family, rows) => {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                r#"
                INSERT INTO {} (
                    company_id,
                    job_id,
                    branch_id,
                    dedup_key,
                    period,
                    entity_document,
                    direction,
                    counterparty_code,
                    document_model,
                    series,
                    document_number,
                    access_key,
                    issue_date,
                    amount,
                    icms,
                    pis,
                    cofins
                )
                "#,
                family.table()
            ));
            query_builder.push_values(rows, |mut b, record| {
                b.push_bind(company_id)
                    .push_bind(job_id)
                    .push_bind(record.branch_id)
                    .push_bind(record.dedup_key())
                    .push_bind(record.period)
                    .push_bind(&record.entity_document)
                    .push_bind(record.direction.as_str())
                    .push_bind(&record.counterparty_code)
                    .push_bind(&record.document_model)
                    .push_bind(&record.series)
                    .push_bind(&record.document_number)
                    .push_bind(&record.access_key)
                    .push_bind(record.issue_date)
                    .push_bind(&record.amount)
                    .push_bind(&record.icms)
                    .push_bind(&record.pis)
                    .push_bind(&record.cofins);
            });
            query_builder
        },
    };
    Some(query_builder)
}

fn conflict_clause(destination: Destination) -> &'static str {
    match destination {
        Destination::Counterparties => {
            r#"
            ON CONFLICT (company_id, code)
            DO UPDATE SET
                name = EXCLUDED.name,
                document = COALESCE(EXCLUDED.document, counterparties.document),
                state_registration = COALESCE(EXCLUDED.state_registration, counterparties.state_registration),
                city_code = COALESCE(EXCLUDED.city_code, counterparties.city_code),
                job_id = EXCLUDED.job_id,
                updated_at = NOW()
            "#
        },
        Destination::Ledger(_) => {
            r#"
            ON CONFLICT (company_id, dedup_key)
            DO UPDATE SET
                issue_date = EXCLUDED.issue_date,
                amount = EXCLUDED.amount,
                icms = EXCLUDED.icms,
                pis = EXCLUDED.pis,
                cofins = EXCLUDED.cofins,
                job_id = EXCLUDED.job_id,
                updated_at = NOW()
            "#
        },
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn upsert(&self, scope: &WriteScope, batch: RowBatch<'_>) -> Result<u64, WriteError> {
        let destination = batch.destination();
        let Some(mut query_builder) = insert_values(scope, batch) else {
            return Ok(0);
        };
        query_builder.push(conflict_clause(destination));

        match query_builder.build().execute(&self.pool).await {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) if sql_state(&err).as_deref() == Some(MISSING_CONSTRAINT) => {
                Err(WriteError::MissingConstraint(destination.table().to_string()))
            },
            Err(err) => Err(WriteError::from_sqlx(
                format!("upsert into {} failed", destination.table()),
                err,
            )),
        }
    }

    async fn insert(&self, scope: &WriteScope, batch: RowBatch<'_>) -> Result<u64, WriteError> {
        let table = batch.destination().table();
        let Some(mut statement) = insert_values(scope, batch) else {
            return Ok(0);
        };
        let mut tx = self.pool.begin().await?;

        sqlx::query("SAVEPOINT batch_insert").execute(&mut *tx).await?;
        let whole = statement.build().execute(&mut *tx).await;

        let written = match whole {
            Ok(result) => result.rows_affected(),
            Err(err) if sql_state(&err).as_deref() == Some(UNIQUE_VIOLATION) => {
                debug!(table, rows = batch.len(), "Batch hit duplicates, inserting row by row");
                sqlx::query("ROLLBACK TO SAVEPOINT batch_insert")
                    .execute(&mut *tx)
                    .await?;

                let mut written = 0;
                let mut skipped = 0;
                for index in 0..batch.len() {
                    sqlx::query("SAVEPOINT row_insert").execute(&mut *tx).await?;
                    let Some(mut row_statement) =
                        insert_values(scope, batch.slice(index..index + 1))
                    else {
                        continue;
                    };
                    let single = row_statement.build().execute(&mut *tx).await;

                    match single {
                        Ok(result) => {
                            sqlx::query("RELEASE SAVEPOINT row_insert")
                                .execute(&mut *tx)
                                .await?;
                            written += result.rows_affected();
                        },
                        Err(err) if sql_state(&err).as_deref() == Some(UNIQUE_VIOLATION) => {
                            sqlx::query("ROLLBACK TO SAVEPOINT row_insert")
                                .execute(&mut *tx)
                                .await?;
                            skipped += 1;
                        },
                        Err(err) => {
                            return Err(WriteError::from_sqlx(
                                format!("insert into {} failed", table),
                                err,
                            ))
                        },
                    }
                }

                if skipped > 0 {
                    warn!(table, skipped, "Skipped duplicate rows on fallback insert");
                }
                written
            },
            Err(err) => {
                return Err(WriteError::from_sqlx(
                    format!("insert into {} failed", table),
                    err,
                ))
            },
        };

        tx.commit().await?;
        Ok(written)
    }
}
