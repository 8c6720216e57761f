// Administrative leases. They use the same primitive as claims, under an
// owner token that never collides with a runtime's `<runtime>/<workflow>`.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::info;

use idhub_core::{EntityStore, StatefulEntity, StoreError};

use super::Kind;
use crate::backend::Stores;

pub const ADMIN_OWNER: &str = "admin";

#[derive(Args)]
pub struct Lease {
    #[arg(value_enum)]
    pub kind: Kind,

    pub id: String,

    /// Lease owner token
    #[arg(long, default_value = ADMIN_OWNER)]
    pub owner: String,

    /// Lease duration in seconds
    #[arg(long, default_value_t = 300)]
    pub ttl_secs: u64,
}

impl Lease {
    pub async fn execute(self, stores: &Stores) -> Result<()> {
        let ttl = Duration::from_secs(self.ttl_secs);
        match self.kind {
            Kind::HolderRequest => {
                acquire(stores.holder_requests.as_ref(), &self.id, &self.owner, ttl).await?
            }
            Kind::Issuance => acquire(stores.issuance.as_ref(), &self.id, &self.owner, ttl).await?,
        }
        println!(
            "✓ Leased {} to {} for {}s",
            self.id, self.owner, self.ttl_secs
        );
        Ok(())
    }
}

async fn acquire<E: StatefulEntity>(
    store: &dyn EntityStore<E>,
    id: &str,
    owner: &str,
    ttl: Duration,
) -> Result<()> {
    if store.acquire_lease(id, owner, ttl).await? {
        info!(entity_type = E::ENTITY_TYPE, entity_id = %id, owner, "lease acquired");
        return Ok(());
    }
    let holder = store
        .find_by_id(id)
        .await?
        .and_then(|entity| entity.meta().lease.clone())
        .map(|lease| lease.owner);
    Err(StoreError::stale_lease(E::ENTITY_TYPE, id, holder).into())
}

#[derive(Args)]
pub struct Release {
    #[arg(value_enum)]
    pub kind: Kind,

    pub id: String,

    /// Owner token the lease was taken with
    #[arg(long, default_value = ADMIN_OWNER)]
    pub owner: String,
}

impl Release {
    pub async fn execute(self, stores: &Stores) -> Result<()> {
        match self.kind {
            Kind::HolderRequest => {
                stores
                    .holder_requests
                    .release_lease(&self.id, &self.owner)
                    .await?
            }
            Kind::Issuance => stores.issuance.release_lease(&self.id, &self.owner).await?,
        }
        println!("✓ Released {}", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idhub_core::workflows::{HolderCredentialRequest, RequestedCredential};
    use idhub_core::{Clock, SystemClock};

    use crate::backend::Backend;
    use crate::commands::Delete;

    async fn seeded() -> Result<Stores> {
        let stores = Backend::connect("memory:").await?.stores(SystemClock::shared())?;
        let request = HolderCredentialRequest::new(
            "req-1",
            "tenant-a",
            "did:web:issuer",
            vec![RequestedCredential {
                id: "membership".to_string(),
                credential_type: "MembershipCredential".to_string(),
                format: "VC1_0_JWT".to_string(),
            }],
            SystemClock.now(),
        )?;
        stores.holder_requests.create(&request).await?;
        Ok(stores)
    }

    fn lease(owner: &str) -> Lease {
        Lease {
            kind: Kind::HolderRequest,
            id: "req-1".to_string(),
            owner: owner.to_string(),
            ttl_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_admin_lease_blocks_other_owners() -> Result<()> {
        let stores = seeded().await?;
        lease(ADMIN_OWNER).execute(&stores).await?;

        let err = lease("runtime-1/holder-credential-request")
            .execute(&stores)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::StaleLease { holder: Some(holder), .. }) if holder == ADMIN_OWNER
        ));

        // Plain admin deletes respect the lease; deleting as its owner works
        let delete = |owner: Option<&str>| Delete {
            kind: Kind::HolderRequest,
            id: "req-1".to_string(),
            owner: owner.map(str::to_string),
        };
        assert!(delete(None).execute(&stores).await.is_err());
        delete(Some(ADMIN_OWNER)).execute(&stores).await?;
        assert!(stores.holder_requests.find_by_id("req-1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_requires_the_owner() -> Result<()> {
        let stores = seeded().await?;
        lease(ADMIN_OWNER).execute(&stores).await?;

        let release = |owner: &str| Release {
            kind: Kind::HolderRequest,
            id: "req-1".to_string(),
            owner: owner.to_string(),
        };
        assert!(release("someone-else").execute(&stores).await.is_err());
        release(ADMIN_OWNER).execute(&stores).await?;
        assert!(!stores.holder_requests.is_leased_by("req-1", ADMIN_OWNER).await?);
        Ok(())
    }
}
