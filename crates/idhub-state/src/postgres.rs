use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::{PgPoolOptions, PgRow};

use idhub_core::{SharedClock, StatefulEntity};

use crate::delegation::impl_sql_entity_store;
use crate::translate::Dialect;
use crate::translate::sql::Statements;

pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::new_with_pool_size(database_url, 10).await
    }

    pub async fn new_with_pool_size(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store<E: StatefulEntity>(&self, clock: SharedClock) -> PostgresEntityStore<E> {
        PostgresEntityStore::new(self.pool.clone(), clock)
    }
}

/// Entity store over one Postgres table. Claims lock candidate rows with
/// `FOR UPDATE SKIP LOCKED`, so concurrent claimers never wait on each other.
pub struct PostgresEntityStore<E> {
    pool: PgPool,
    clock: SharedClock,
    statements: Statements<E>,
}

impl_sql_entity_store!(PostgresEntityStore, sqlx::Postgres, PgRow, Dialect::Postgres);
