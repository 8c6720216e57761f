use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use idhub_core::clock::{SharedClock, SystemClock};
use idhub_core::entity::StatefulEntity;
use idhub_core::lease::{self, Caller, LeaseConflict};
use idhub_core::query::{Criterion, QuerySpec};
use idhub_core::state::WorkflowState;
use idhub_core::{EntityStore, StoreError, StoreResult};

use crate::translate::CompiledQuery;

/// Entity store backed by a map. Every mutation runs under one write lock,
/// which makes claims atomic within the process.
#[derive(Debug, Clone)]
pub struct InMemoryEntityStore<E> {
    entries: Arc<RwLock<HashMap<String, E>>>,
    clock: SharedClock,
}

impl<E: StatefulEntity> InMemoryEntityStore<E> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<E: StatefulEntity> Default for InMemoryEntityStore<E> {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

pub(crate) fn stale<E: StatefulEntity>(id: &str, conflict: Option<LeaseConflict>) -> StoreError {
    StoreError::stale_lease(E::ENTITY_TYPE, id, conflict.map(|c| c.holder))
}

impl<E: StatefulEntity> InMemoryEntityStore<E> {
    async fn overwrite(&self, entity: &E, caller: Caller<'_>, release: bool) -> StoreResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let stored = entries
            .get_mut(entity.id())
            .ok_or_else(|| StoreError::not_found(E::ENTITY_TYPE, entity.id()))?;
        lease::authorize_write(stored.meta().lease.as_ref(), caller, now)
            .map_err(|conflict| stale::<E>(entity.id(), conflict))?;

        let mut next = entity.clone();
        let meta = next.meta_mut();
        meta.created_at = stored.meta().created_at;
        meta.updated_at = now;
        meta.lease = if release {
            None
        } else {
            stored.meta().lease.clone()
        };
        *stored = next;
        Ok(())
    }
}

#[async_trait]
impl<E: StatefulEntity> EntityStore<E> for InMemoryEntityStore<E> {
    async fn create(&self, entity: &E) -> StoreResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        if entries.contains_key(entity.id()) {
            return Err(StoreError::duplicate(E::ENTITY_TYPE, entity.id()));
        }
        let mut stored = entity.clone();
        stored.meta_mut().lease = None;
        stored.meta_mut().updated_at = now;
        entries.insert(entity.id().to_string(), stored);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<E>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn update(&self, entity: &E, caller: Caller<'_>) -> StoreResult<()> {
        self.overwrite(entity, caller, false).await
    }

    async fn commit(&self, entity: &E, owner: &str) -> StoreResult<()> {
        self.overwrite(entity, Caller::LeaseOwner(owner), true).await
    }

    async fn release_lease(&self, id: &str, owner: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let stored = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(E::ENTITY_TYPE, id))?;
        lease::release(stored.meta().lease.as_ref(), owner, now)
            .map_err(|conflict| stale::<E>(id, Some(conflict)))?;
        stored.meta_mut().lease = None;
        Ok(())
    }

    async fn delete(&self, id: &str, caller: Caller<'_>) -> StoreResult<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let stored = entries
            .get(id)
            .ok_or_else(|| StoreError::not_found(E::ENTITY_TYPE, id))?;
        lease::authorize_write(stored.meta().lease.as_ref(), caller, now)
            .map_err(|conflict| stale::<E>(id, conflict))?;
        entries.remove(id);
        Ok(())
    }

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<E>> {
        let query = CompiledQuery::compile::<E>(spec)?;
        let snapshot: Vec<E> = self.entries.read().await.values().cloned().collect();
        query.apply(snapshot)
    }

    async fn count(&self, filter: &[Criterion]) -> StoreResult<u64> {
        let query = CompiledQuery::filter::<E>(filter)?;
        let snapshot: Vec<E> = self.entries.read().await.values().cloned().collect();
        query.count(snapshot)
    }

    async fn claim_next(
        &self,
        max: usize,
        states: &[E::State],
        owner: &str,
        lease_duration: Duration,
    ) -> StoreResult<Vec<E>> {
        let now = self.clock.now();
        let codes: Vec<i32> = states.iter().map(|state| state.code()).collect();
        let mut entries = self.entries.write().await;

        let mut eligible: Vec<&mut E> = entries
            .values_mut()
            .filter(|entity| {
                codes.contains(&entity.meta().state)
                    && lease::is_free(entity.meta().lease.as_ref(), now)
            })
            .collect();
        eligible.sort_by(|a, b| {
            let (a, b) = (a.meta(), b.meta());
            (a.updated_at, a.created_at, &a.id).cmp(&(b.updated_at, b.created_at, &b.id))
        });

        let mut claimed = Vec::new();
        for entity in eligible.into_iter().take(max) {
            let granted = lease::try_acquire(entity.meta().lease.as_ref(), owner, lease_duration, now)
                .map_err(|conflict| stale::<E>(entity.id(), Some(conflict)))?;
            entity.meta_mut().lease = Some(granted);
            claimed.push(entity.clone());
        }
        Ok(claimed)
    }

    async fn acquire_lease(&self, id: &str, owner: &str, duration: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let stored = entries
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(E::ENTITY_TYPE, id))?;
        match lease::try_acquire(stored.meta().lease.as_ref(), owner, duration, now) {
            Ok(granted) => {
                stored.meta_mut().lease = Some(granted);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn is_leased_by(&self, id: &str, owner: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .read()
            .await
            .get(id)
            .is_some_and(|entity| lease::is_held_by(entity.meta().lease.as_ref(), owner, now)))
    }
}
