use async_trait::async_trait;
use sqlx::mysql::MySqlDatabaseError;
use sqlx::MySqlConnection;

use crate::error::Error;

use super::WriteLockStrategy;

/// MySql user-lock deadlock error (ER_USER_LOCK_DEADLOCK).
const DEADLOCK_ERROR: u32 = 3058;

/// Named metadata lock backed by `GET_LOCK`.
#[derive(Debug, Clone, Copy)]
pub struct MySqlMetadataLockStrategy {
    /// Seconds to wait for the lock; negative means wait forever.
    timeout: i64,
}

impl MySqlMetadataLockStrategy {
    pub fn new() -> Self {
        Self { timeout: -1 }
    }

    pub fn with_timeout(timeout: i64) -> Self {
        Self { timeout }
    }
}

impl Default for MySqlMetadataLockStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WriteLockStrategy<MySqlConnection> for MySqlMetadataLockStrategy {
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
        sqlx::query("DO RELEASE_LOCK(?)").bind(name).execute(conn).await?;
        Ok(true)
    }
}

pub(crate) fn is_deadlock(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|db| db.number() == DEADLOCK_ERROR),
        _ => false,
    }
}
