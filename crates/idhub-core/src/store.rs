use std::time::Duration;

use async_trait::async_trait;

use crate::entity::StatefulEntity;
use crate::error::StoreResult;
use crate::lease::Caller;
use crate::query::{Criterion, QuerySpec};

/// Persistence contract for one entity type.
///
/// Every mutating call is atomic with respect to concurrent callers in any
/// process sharing the backend. Leases live on the entity and are read
/// against the store's clock: an expired lease is the same as none.
#[async_trait]
pub trait EntityStore<E: StatefulEntity>: Send + Sync {
    /// Inserts `entity` unleased. Fails with `Duplicate` when the id exists.
    async fn create(&self, entity: &E) -> StoreResult<()>;

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>>;

    /// Overwrites the stored entity, keeping the stored lease.
    async fn update(&self, entity: &E, caller: Caller<'_>) -> StoreResult<()>;

    /// Overwrites the stored entity and releases `owner`'s lease in one step.
    async fn commit(&self, entity: &E, owner: &str) -> StoreResult<()>;

    async fn release_lease(&self, id: &str, owner: &str) -> StoreResult<()>;

    async fn delete(&self, id: &str, caller: Caller<'_>) -> StoreResult<()>;

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<E>>;

    async fn count(&self, filter: &[Criterion]) -> StoreResult<u64>;

    /// Leases up to `max` unleased entities in `states` to `owner`, least
    /// recently updated first.
    async fn claim_next(
        &self,
        max: usize,
        states: &[E::State],
        owner: &str,
        lease_duration: Duration,
    ) -> StoreResult<Vec<E>>;

    /// Leases one known entity. Returns false while another owner holds it.
    async fn acquire_lease(&self, id: &str, owner: &str, duration: Duration) -> StoreResult<bool>;

    async fn is_leased_by(&self, id: &str, owner: &str) -> StoreResult<bool>;
}
