use anyhow::Result;
use clap::Args;

use idhub_core::Caller;

use super::Kind;
use crate::backend::Stores;

#[derive(Args)]
pub struct Delete {
    #[arg(value_enum)]
    pub kind: Kind,

    pub id: String,

    /// Delete as the holder of this lease instead of as an administrator
    #[arg(long)]
    pub owner: Option<String>,
}

impl Delete {
    pub async fn execute(self, stores: &Stores) -> Result<()> {
        let caller = match self.owner.as_deref() {
            Some(owner) => Caller::LeaseOwner(owner),
            None => Caller::Admin,
        };
        match self.kind {
            Kind::HolderRequest => stores.holder_requests.delete(&self.id, caller).await?,
            Kind::Issuance => stores.issuance.delete(&self.id, caller).await?,
        }
        println!("✓ Deleted {}", self.id);
        Ok(())
    }
}
