// Backend selection by database URL scheme.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::info;

use idhub_core::workflows::{HolderCredentialRequest, IssuanceProcess};
use idhub_core::{EntityStore, SharedClock};
use idhub_state::{FileEntityStore, InMemoryEntityStore};

#[cfg(feature = "postgres")]
use idhub_state::PostgresDatabase;
#[cfg(feature = "sqlite")]
use idhub_state::SqliteDatabase;

/// One store per workflow entity type, all on the same backend.
#[derive(Clone)]
pub struct Stores {
    pub holder_requests: Arc<dyn EntityStore<HolderCredentialRequest>>,
    pub issuance: Arc<dyn EntityStore<IssuanceProcess>>,
}

pub enum Backend {
    Memory,
    Documents(PathBuf),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteDatabase),
    #[cfg(feature = "postgres")]
    Postgres(PostgresDatabase),
}

impl Backend {
    pub async fn connect(database_url: &str) -> Result<Self> {
        if database_url == "memory:" {
            return Ok(Self::Memory);
        }
        if let Some(dir) = database_url.strip_prefix("file://") {
            if dir.is_empty() {
                bail!("file:// URL needs a directory: {database_url}");
            }
            return Ok(Self::Documents(PathBuf::from(dir)));
        }
        if database_url.starts_with("sqlite:") {
            #[cfg(feature = "sqlite")]
            return Ok(Self::Sqlite(SqliteDatabase::new(database_url).await?));
            #[cfg(not(feature = "sqlite"))]
            bail!("idhub was built without the 'sqlite' feature");
        }
        if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            #[cfg(feature = "postgres")]
            return Ok(Self::Postgres(PostgresDatabase::new(database_url).await?));
            #[cfg(not(feature = "postgres"))]
            bail!("idhub was built without the 'postgres' feature");
        }
        bail!(
            "Unsupported database URL '{database_url}' (expected sqlite:, postgres://, file:// or memory:)"
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Documents(_) => "file",
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        match self {
            Self::Memory => {}
            Self::Documents(root) => std::fs::create_dir_all(root)?,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(db) => db.run_migrations().await?,
            #[cfg(feature = "postgres")]
            Self::Postgres(db) => db.run_migrations().await?,
        }
        info!(backend = self.name(), "storage ready");
        Ok(())
    }

    pub fn stores(&self, clock: SharedClock) -> Result<Stores> {
        let stores = match self {
            Self::Memory => Stores {
                holder_requests: Arc::new(InMemoryEntityStore::<HolderCredentialRequest>::new(
                    clock.clone(),
                )),
                issuance: Arc::new(InMemoryEntityStore::<IssuanceProcess>::new(clock)),
            },
            Self::Documents(root) => Stores {
                holder_requests: Arc::new(FileEntityStore::<HolderCredentialRequest>::open(
                    root,
                    clock.clone(),
                )?),
                issuance: Arc::new(FileEntityStore::<IssuanceProcess>::open(root, clock)?),
            },
            #[cfg(feature = "sqlite")]
            Self::Sqlite(db) => Stores {
                holder_requests: Arc::new(db.store::<HolderCredentialRequest>(clock.clone())),
                issuance: Arc::new(db.store::<IssuanceProcess>(clock)),
            },
            #[cfg(feature = "postgres")]
            Self::Postgres(db) => Stores {
                holder_requests: Arc::new(db.store::<HolderCredentialRequest>(clock.clone())),
                issuance: Arc::new(db.store::<IssuanceProcess>(clock)),
            },
        };
        Ok(stores)
    }
}
