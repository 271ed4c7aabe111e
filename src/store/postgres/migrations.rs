use sqlx::postgres::PgQueryResult;
use sqlx::{Pool, Postgres, Transaction};

/// Creates the central registry tables if they do not exist. Should be run
/// once per application startup; the store builder does so by default.
pub struct Migrations;

impl Migrations {
    pub async fn run(
        pool: &Pool<Postgres>,
        event_streams_table: &str,
        projections_table: &str,
    ) -> Result<(), sqlx::Error> {
        let mut transaction: Transaction<Postgres> = pool.begin().await?;

        let migrations: Vec<String> = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {event_streams_table} (\
                 real_stream_name VARCHAR(150) NOT NULL, \
                 stream_name VARCHAR(191) NOT NULL, \
                 metadata JSONB NOT NULL DEFAULT '{{}}', \
                 category VARCHAR(150), \
                 PRIMARY KEY (real_stream_name))"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS ix_{event_streams_table}_category \
                 ON {event_streams_table} (category)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {projections_table} (\
                 no BIGSERIAL, \
                 name VARCHAR(150) NOT NULL, \
                 position JSONB, \
                 state JSONB, \
                 status VARCHAR(28) NOT NULL, \
                 locked_until TIMESTAMPTZ, \
                 PRIMARY KEY (no), \
                 UNIQUE (name))"
            ),
        ];

        for migration in migrations {
            let _: PgQueryResult = sqlx::query(migration.as_str())
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await
    }
}
