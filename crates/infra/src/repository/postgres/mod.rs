//! Postgres-backed repositories (sqlx).
//!
//! ## Error Mapping
//!
//! | sqlx error | SQLSTATE | RepositoryError | Scenario |
//! |------------|----------|-----------------|----------|
//! | Database | `40001` | `Conflict` | Serialization failure under REPEATABLE READ |
//! | Database | `40P01` | `Conflict` | Deadlock detected |
//! | Database | `23505` | `Conflict` | Unique violation |
//! | Database | other | `Database` | Check/FK violations and the rest |
//! | RowNotFound | n/a | `NotFound` | `fetch_one` found nothing |
//! | other | n/a | `Database` | Pool closed, IO, protocol errors |
//!
//! Every mutating transaction runs at REPEATABLE READ so that concurrent
//! reservations against the same stock row fail with a conflict instead of
//! overwriting each other.

use sqlx::{PgPool, Postgres, Transaction};

use super::RepositoryError;

mod order;
mod stock;

pub use order::PostgresOrderRepository;
pub use stock::PostgresStockRepository;

const SCHEMA: &str = include_str!("../../../migrations/0001_schema.sql");

/// Create all tables if they do not exist yet.
pub async fn apply_schema(pool: &PgPool) -> Result<(), RepositoryError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("apply_schema", e))?;
    Ok(())
}

/// Begin a transaction at REPEATABLE READ.
pub(crate) async fn begin_repeatable_read(
    pool: &PgPool,
    operation: &str,
) -> Result<Transaction<'static, Postgres>, RepositoryError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(tx)
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") | Some("23505") => RepositoryError::Conflict(msg),
                _ => RepositoryError::Database(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            RepositoryError::NotFound(format!("row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::Database(format!("connection pool closed in {}", operation))
        }
        _ => RepositoryError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

pub(crate) fn decode_error(operation: &str, err: impl core::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(format!("failed to decode row in {}: {}", operation, err))
}

/// Stored counts are BIGINT with a `>= 0` check.
pub(crate) fn to_count(operation: &str, raw: i64) -> Result<u64, RepositoryError> {
    u64::try_from(raw).map_err(|e| decode_error(operation, e))
}

pub(crate) fn to_db_count(operation: &str, count: u64) -> Result<i64, RepositoryError> {
    i64::try_from(count)
        .map_err(|_| RepositoryError::Database(format!("count {count} out of range in {operation}")))
}
