use sqlx::{MySql, Pool};

use crate::sql::Dialect;

/// Creates the central registry tables if they do not exist. DDL commits
/// implicitly on MySql, so the statements run outside a transaction.
pub struct Migrations;

impl Migrations {
    pub async fn run(
        pool: &Pool<MySql>,
        dialect: Dialect,
        event_streams_table: &str,
        projections_table: &str,
    ) -> Result<(), sqlx::Error> {
        let migrations = match dialect {
            Dialect::MariaDb => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {event_streams_table} (\
                     real_stream_name VARCHAR(150) NOT NULL, \
                     stream_name VARCHAR(191) NOT NULL, \
                     metadata LONGTEXT NOT NULL, \
                     category VARCHAR(150), \
                     CHECK (JSON_VALID(metadata)), \
                     PRIMARY KEY (real_stream_name), \
                     KEY ix_category (category)\
                     ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {projections_table} (\
                     no BIGINT NOT NULL AUTO_INCREMENT, \
                     name VARCHAR(150) NOT NULL, \
                     position LONGTEXT, \
                     state LONGTEXT, \
                     status VARCHAR(28) NOT NULL, \
                     locked_until DATETIME(6), \
                     CHECK (position IS NULL OR JSON_VALID(position)), \
                     CHECK (state IS NULL OR JSON_VALID(state)), \
                     PRIMARY KEY (no), \
                     UNIQUE KEY ix_name (name)\
                     ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_general_ci"
                ),
            ],
            _ => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {event_streams_table} (\
                     real_stream_name VARCHAR(150) NOT NULL, \
                     stream_name VARCHAR(191) NOT NULL, \
                     metadata JSON NOT NULL, \
                     category VARCHAR(150), \
                     PRIMARY KEY (real_stream_name), \
                     KEY ix_category (category)\
                     ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin"
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {projections_table} (\
                     no BIGINT NOT NULL AUTO_INCREMENT, \
                     name VARCHAR(150) NOT NULL, \
                     position JSON, \
                     state JSON, \
                     status VARCHAR(28) NOT NULL, \
                     locked_until DATETIME(6), \
                     PRIMARY KEY (no), \
                     UNIQUE KEY ix_name (name)\
                     ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin"
                ),
            ],
        };

        for migration in migrations {
            sqlx::query(migration.as_str()).execute(pool).await?;
        }
        Ok(())
    }
}
