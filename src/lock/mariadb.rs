use async_trait::async_trait;
use sqlx::MySqlConnection;

use crate::error::Error;

use super::mysql::is_deadlock;
use super::WriteLockStrategy;

/// Named metadata lock for MariaDb.
///
/// MariaDb rejects negative `GET_LOCK` timeouts, so waiting forever is
/// approximated with a very large default. `RELEASE_LOCK` is issued as a
/// select and its result row consumed before returning.
#[derive(Debug, Clone, Copy)]
pub struct MariaDbMetadataLockStrategy {
    timeout: i64,
}

impl MariaDbMetadataLockStrategy {
    pub fn new() -> Self {
        Self { timeout: 0xFF_FFFF }
    }

    pub fn with_timeout(timeout: i64) -> Result<Self, Error> {
        if timeout < 0 {
            return Err(Error::InvalidArgument(
                "lock timeout must be zero or greater".to_string(),
            ));
        }
        Ok(Self { timeout })
    }
}

impl Default for MariaDbMetadataLockStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WriteLockStrategy<MySqlConnection> for MariaDbMetadataLockStrategy {
    async fn acquire(&self, conn: &mut MySqlConnection, name: &str) -> Result<bool, Error> {
        let result = sqlx::query_scalar::<_, Option<i64>>("SELECT GET_LOCK(?, ?)")
            .bind(name)
            .bind(self.timeout)
            .fetch_one(conn)
            .await;

        match result {
            Ok(value) => Ok(value == Some(1)),
            Err(err) if is_deadlock(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, conn: &mut MySqlConnection, name: &str) -> Result<bool, Error> {
        let _: Option<i64> = sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
            .bind(name)
            .fetch_one(conn)
            .await?;
        Ok(true)
    }
}
