use super::{is_plain_identifier, DbPool};
use crate::steps::StepAction;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::migrate::Migrator;
use std::path::PathBuf;

/// Applies SQL migrations from a directory with sqlx's migrator.
/// Already-applied migrations are skipped, so re-running is a no-op.
pub struct SqlxMigrateAction {
    pool: DbPool,
    dir: PathBuf,
}

impl SqlxMigrateAction {
    pub fn new(pool: DbPool, dir: PathBuf) -> Self {
        Self { pool, dir }
    }
}

#[async_trait]
impl StepAction for SqlxMigrateAction {
    async fn run(&self) -> Result<Option<String>> {
        let migrator = Migrator::new(self.dir.as_path())
            .await
            .with_context(|| format!("loading migrations from {}", self.dir.display()))?;
        migrator
            .run(&self.pool)
            .await
            .context("applying migrations")?;
        Ok(Some(format!(
            "{} migration(s) up to date from {}",
            migrator.iter().count(),
            self.dir.display()
        )))
    }
}

/// Creates the database cache table if it is missing, using the layout the
/// application's database cache backend expects.
pub struct CacheTableAction {
    pool: DbPool,
    table: String,
}

impl CacheTableAction {
    pub fn new(pool: DbPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl StepAction for CacheTableAction {
    async fn run(&self) -> Result<Option<String>> {
        if !is_plain_identifier(&self.table) {
            bail!("cache table name '{}' is not a plain identifier", self.table);
        }

        let create_table = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                "cache_key" varchar(255) NOT NULL PRIMARY KEY,
                "value" text NOT NULL,
                "expires" timestamp with time zone NOT NULL
            )"#,
            table = self.table
        );
        let create_index = format!(
            r#"CREATE INDEX IF NOT EXISTS "{table}_expires" ON "{table}" ("expires")"#,
            table = self.table
        );

        let mut tx = self.pool.begin().await.context("starting transaction")?;
        sqlx::query(&create_table)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("creating cache table '{}'", self.table))?;
        sqlx::query(&create_index)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("indexing cache table '{}'", self.table))?;
        tx.commit().await.context("committing cache table")?;

        Ok(Some(format!("cache table '{}' present", self.table)))
    }
}

/// Deletes expired rows from the session table.
pub struct ClearSessionsAction {
    pool: DbPool,
}

impl ClearSessionsAction {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StepAction for ClearSessionsAction {
    async fn run(&self) -> Result<Option<String>> {
        let result = sqlx::query("DELETE FROM django_session WHERE expire_date < NOW()")
            .execute(&self.pool)
            .await
            .context("deleting expired sessions")?;
        Ok(Some(format!("{} expired session(s) removed", result.rows_affected())))
    }
}
