//! `PostgreSQL` access.
//!
//! [`reports`] runs the report queries and feeds their rows into the
//! assemblers of `limes-core`; [`quotas`] writes accepted quota and
//! rate-limit changes. All queries use bound parameters.

pub mod quotas;
pub mod reports;

use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::info;

const SCHEMA: &str = include_str!("schema.sql");

/// Opens the connection pool and creates missing tables.
///
/// # Errors
///
/// Returns [`sqlx::Error`] if the database is unreachable or the schema
/// cannot be created.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Creates all tables and indexes that do not exist yet.
///
/// # Errors
///
/// Returns [`sqlx::Error`] if a statement fails.
pub async fn bootstrap_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema is up to date");
    Ok(())
}

/// Builds a query with all `args` bound as text, in order.
fn bind_text_args<'q>(sql: &'q str, args: &'q [String]) -> Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(sql), |query, arg| query.bind(arg.as_str()))
}

/// Reads a nullable counter column. Counters are never negative; a negative
/// value would be corrupt data and reads as zero.
fn get_u64(row: &PgRow, idx: usize) -> Result<Option<u64>, sqlx::Error> {
    Ok(row
        .try_get::<Option<i64>, _>(idx)?
        .map(|value| u64::try_from(value).unwrap_or(0)))
}

/// Converts a value for a `BIGINT` column, saturating at `i64::MAX`.
fn to_db_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_every_table_idempotently() {
        let creates = SCHEMA.matches("CREATE TABLE").count();
        assert_eq!(creates, SCHEMA.matches("CREATE TABLE IF NOT EXISTS").count());
        for table in ["domains", "projects", "project_az_resources", "project_rates", "cluster_az_resources"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")), "{table}");
        }
    }

    #[test]
    fn database_values_saturate() {
        assert_eq!(to_db_value(5), 5);
        assert_eq!(to_db_value(u64::MAX), i64::MAX);
    }
}
