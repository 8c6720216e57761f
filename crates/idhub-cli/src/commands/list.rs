use anyhow::Result;
use clap::Args;
use serde_json::Value;

use idhub_core::query::DEFAULT_PAGE_SIZE;
use idhub_core::{
    Criterion, EntityStore, Operator, QuerySpec, SortOrder, StatefulEntity, WorkflowState,
};

use super::Kind;
use crate::backend::Stores;

/// Parses `FIELD OP VALUE`. The value is read as JSON when it parses as JSON
/// (numbers, null, arrays, quoted strings) and as a plain string otherwise.
pub fn parse_criterion(raw: &str) -> Result<Criterion, String> {
    let malformed = || format!("expected `FIELD OP VALUE`, got `{raw}`");
    let (field, rest) = raw.trim().split_once(char::is_whitespace).ok_or_else(malformed)?;
    let (operator, value) = rest
        .trim_start()
        .split_once(char::is_whitespace)
        .ok_or_else(malformed)?;
    let value = value.trim();
    if value.is_empty() {
        return Err(malformed());
    }
    let operator: Operator = operator.parse().map_err(|err| format!("{err}"))?;
    let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::from(value));
    Ok(Criterion::new(field, operator, value))
}

#[derive(Args)]
pub struct List {
    /// Entity kind to list
    #[arg(value_enum)]
    pub kind: Kind,

    /// Filter as "FIELD OP VALUE", e.g. "state = SUBMITTED" (repeatable, ANDed)
    #[arg(long = "filter", value_parser = parse_criterion)]
    pub filters: Vec<Criterion>,

    /// Field to sort by (creation order otherwise)
    #[arg(long)]
    pub sort: Option<String>,

    /// Sort descending
    #[arg(long)]
    pub desc: bool,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub limit: usize,

    /// Print the entities as a JSON array
    #[arg(long)]
    pub json: bool,
}

impl List {
    fn spec(&self) -> QuerySpec {
        let mut spec = QuerySpec {
            filter: self.filters.clone(),
            ..QuerySpec::default()
        };
        if let Some(field) = &self.sort {
            let order = if self.desc { SortOrder::Desc } else { SortOrder::Asc };
            spec = spec.sort_by(field.clone(), order);
        }
        spec.offset(self.offset).limit(self.limit)
    }

    pub async fn execute(self, stores: &Stores) -> Result<()> {
        let spec = self.spec();
        match self.kind {
            Kind::HolderRequest => {
                print_page(stores.holder_requests.as_ref(), &spec, self.json).await
            }
            Kind::Issuance => print_page(stores.issuance.as_ref(), &spec, self.json).await,
        }
    }
}

async fn print_page<E: StatefulEntity>(
    store: &dyn EntityStore<E>,
    spec: &QuerySpec,
    json: bool,
) -> Result<()> {
    let entities = store.query(spec).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entities)?);
        return Ok(());
    }

    let total = store.count(&spec.filter).await?;
    if entities.is_empty() {
        println!("No {} entities found", E::ENTITY_TYPE);
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:<6} {:<20} {:<24}",
        "ID", "State", "Tries", "Updated", "Lease"
    );
    println!("{}", "-".repeat(100));
    for entity in &entities {
        let meta = entity.meta();
        let state = entity.state().map_or("?", |state| state.name());
        let lease = meta
            .lease
            .as_ref()
            .map(|lease| format!("{} until {}", lease.owner, lease.expires_at.format("%H:%M:%S")))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36} {:<10} {:<6} {:<20} {:<24}",
            meta.id,
            state,
            meta.retry_count,
            meta.updated_at.format("%Y-%m-%d %H:%M:%S"),
            lease
        );
    }
    println!(
        "Showing {}-{} of {}",
        spec.offset + 1,
        spec.offset + entities.len(),
        total
    );
    Ok(())
}
