//! Write lock strategies guarding the append path. The lock name space is
//! per stream table; a lock is held on one connection for the duration of a
//! single append.

#[cfg(feature = "mysql")]
pub mod mariadb;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::error::Error;

/// Session lock over a database connection. `acquire` returns `false` when
/// the lock could not be obtained; the store maps that to a concurrency
/// error.
#[async_trait]
pub trait WriteLockStrategy<C: Send>: Send + Sync {
    async fn acquire(&self, conn: &mut C, name: &str) -> Result<bool, Error>;
    async fn release(&self, conn: &mut C, name: &str) -> Result<bool, Error>;
}

/// Default strategy: no locking, every acquisition succeeds. Concurrent
/// writers are still serialized by the unique constraints of the stream
/// table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLock;

#[async_trait]
impl<C: Send> WriteLockStrategy<C> for NoLock {
    async fn acquire(&self, _conn: &mut C, _name: &str) -> Result<bool, Error> {
        Ok(true)
    }

    async fn release(&self, _conn: &mut C, _name: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

/// Lock name for a stream table.
pub(crate) fn write_lock_name(table_name: &str) -> String {
    format!("{table_name}_write_lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_names_are_derived_from_the_table_name() {
        assert_eq!(write_lock_name("_abc"), "_abc_write_lock");
    }
}
