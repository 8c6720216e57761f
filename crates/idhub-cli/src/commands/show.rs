use anyhow::Result;
use clap::Args;

use idhub_core::{EntityStore, StatefulEntity, StoreError};

use super::Kind;
use crate::backend::Stores;

#[derive(Args)]
pub struct Show {
    #[arg(value_enum)]
    pub kind: Kind,

    pub id: String,
}

impl Show {
    pub async fn execute(self, stores: &Stores) -> Result<()> {
        let document = match self.kind {
            Kind::HolderRequest => render(stores.holder_requests.as_ref(), &self.id).await?,
            Kind::Issuance => render(stores.issuance.as_ref(), &self.id).await?,
        };
        println!("{document}");
        Ok(())
    }
}

async fn render<E: StatefulEntity>(store: &dyn EntityStore<E>, id: &str) -> Result<String> {
    let entity = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| StoreError::not_found(E::ENTITY_TYPE, id))?;
    Ok(serde_json::to_string_pretty(&entity)?)
}
