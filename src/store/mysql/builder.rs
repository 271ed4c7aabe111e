use sqlx::{MySql, MySqlConnection, Pool};

use crate::error::Error;
use crate::lock::{NoLock, WriteLockStrategy};
use crate::sql::{Dialect, ProjectionStatements, StoreStatements};
use crate::store::{DEFAULT_EVENT_STREAMS_TABLE, DEFAULT_LOAD_BATCH_SIZE, DEFAULT_PROJECTIONS_TABLE};
use crate::strategy::mariadb::MariaDbSingleStreamStrategy;
use crate::strategy::mysql::MySqlSingleStreamStrategy;
use crate::strategy::PersistenceStrategy;

use super::migrations::Migrations;
use super::{InnerMySqlStore, MySqlEventStore};

/// Struct used to build a brand new [`MySqlEventStore`].
pub struct MySqlEventStoreBuilder {
    pool: Pool<MySql>,
    dialect: Dialect,
    strategy: Box<dyn PersistenceStrategy>,
    write_lock: Box<dyn WriteLockStrategy<MySqlConnection>>,
    event_streams_table: String,
    projections_table: String,
    load_batch_size: i64,
    disable_transaction_handling: bool,
    run_migrations: bool,
}

impl MySqlEventStoreBuilder {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self {
            pool,
            dialect: Dialect::MySql,
            strategy: Box::new(MySqlSingleStreamStrategy),
            write_lock: Box::new(NoLock),
            event_streams_table: DEFAULT_EVENT_STREAMS_TABLE.to_string(),
            projections_table: DEFAULT_PROJECTIONS_TABLE.to_string(),
            load_batch_size: DEFAULT_LOAD_BATCH_SIZE,
            disable_transaction_handling: false,
            run_migrations: true,
        }
    }

    /// Builder preset for MariaDb: its DDL flavor and default strategy.
    pub fn mariadb(pool: Pool<MySql>) -> Self {
        let mut builder = Self::new(pool);
        builder.dialect = Dialect::MariaDb;
        builder.strategy = Box::new(MariaDbSingleStreamStrategy);
        builder
    }

    pub fn with_strategy(mut self, strategy: impl PersistenceStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn with_write_lock(
        mut self,
        write_lock: impl WriteLockStrategy<MySqlConnection> + 'static,
    ) -> Self {
        self.write_lock = Box::new(write_lock);
        self
    }

    pub fn with_event_streams_table(mut self, table: impl Into<String>) -> Self {
        self.event_streams_table = table.into();
        self
    }

    pub fn with_projections_table(mut self, table: impl Into<String>) -> Self {
        self.projections_table = table.into();
        self
    }

    /// Page size used by `load`/`load_reverse`; must be at least 1.
    pub fn with_load_batch_size(mut self, load_batch_size: i64) -> Self {
        self.load_batch_size = load_batch_size;
        self
    }

    /// Leaves all transaction handling to the caller. Note that a failing
    /// `create` can then leave the registry row behind, since the teardown
    /// runs outside any transaction.
    pub fn disable_transaction_handling(mut self) -> Self {
        self.disable_transaction_handling = true;
        self
    }

    /// Calling this function the caller avoids running migrations. It is
    /// recommended to run migrations at least once per store per startup.
    pub fn without_running_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    pub async fn try_build(self) -> Result<MySqlEventStore, Error> {
        if self.load_batch_size < 1 {
            return Err(Error::InvalidArgument(
                "load batch size must be at least 1".to_string(),
            ));
        }
        if self.run_migrations {
            Migrations::run(
                &self.pool,
                self.dialect,
                &self.event_streams_table,
                &self.projections_table,
            )
            .await?;
        }

        Ok(MySqlEventStore::from_inner(InnerMySqlStore {
            statements: StoreStatements::new(self.dialect, &self.event_streams_table),
            projection_statements: ProjectionStatements::new(self.dialect, &self.projections_table),
            pool: self.pool,
            dialect: self.dialect,
            strategy: self.strategy,
            write_lock: self.write_lock,
            event_streams_table: self.event_streams_table,
            projections_table: self.projections_table,
            load_batch_size: self.load_batch_size,
            disable_transaction_handling: self.disable_transaction_handling,
        }))
    }
}
