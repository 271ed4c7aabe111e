use async_trait::async_trait;
use sqlx::PgConnection;

use crate::error::Error;

use super::WriteLockStrategy;

/// Session level advisory lock keyed by the hashed lock name.
///
/// `pg_advisory_lock` blocks until the lock is granted, so acquisition always
/// reports success once the statement returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdvisoryLockStrategy;

#[async_trait]
impl WriteLockStrategy<PgConnection> for PostgresAdvisoryLockStrategy {
    async fn acquire(&self, conn: &mut PgConnection, name: &str) -> Result<bool, Error> {
        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(name)
            .execute(conn)
            .await?;
        Ok(true)
    }

    async fn release(&self, conn: &mut PgConnection, name: &str) -> Result<bool, Error> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(name)
            .fetch_one(conn)
            .await?;
        Ok(released)
    }
}
