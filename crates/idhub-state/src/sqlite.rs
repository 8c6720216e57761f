use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};

use idhub_core::{SharedClock, StatefulEntity};

use crate::delegation::impl_sql_entity_store;
use crate::translate::Dialect;
use crate::translate::sql::Statements;

pub struct SqliteDatabase {
    pool: SqlitePool,
}

fn sqlite_database_file_path(database_url: &str) -> Option<PathBuf> {
    let raw = if let Some(rest) = database_url.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
        rest
    } else {
        return None;
    };

    let path = raw.split('?').next().unwrap_or(raw);
    if path.is_empty() || path == ":memory:" || path.starts_with("file:") {
        return None;
    }

    Some(PathBuf::from(path))
}

impl SqliteDatabase {
    pub async fn new(database_url: &str) -> Result<Self> {
        if let Some(path) = sqlite_database_file_path(database_url)
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create SQLite database directory: {}",
                    parent.display()
                )
            })?;
        }

        // WAL lets readers proceed during a claim; the busy timeout makes
        // concurrent claimers queue instead of failing.
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations_sqlite")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store<E: StatefulEntity>(&self, clock: SharedClock) -> SqliteEntityStore<E> {
        SqliteEntityStore::new(self.pool.clone(), clock)
    }
}

/// Entity store over one SQLite table. Claims are a single
/// `UPDATE ... RETURNING` statement, serialized by SQLite's write lock.
pub struct SqliteEntityStore<E> {
    pool: SqlitePool,
    clock: SharedClock,
    statements: Statements<E>,
}

impl_sql_entity_store!(SqliteEntityStore, sqlx::Sqlite, SqliteRow, Dialect::Sqlite);
